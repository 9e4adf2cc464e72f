//! Per-call session orchestration.
//!
//! ```text
//! transport ─▶ bus sequencer ─▶ VAD ──────────────┐
//!                    │                             ▼
//!                    └────────▶ STT ─────▶ TurnController ─▶ LLM ─▶ TTS ─▶ bus queue ─▶ transport
//! ```
//!
//! Stages run as separate tasks. Everything that can change the turn state is
//! funnelled into one [`SessionEvent`] channel and handled by the session loop,
//! so exactly one transition evaluation happens at a time.

use super::generation::{GenerationContext, GenerationTask};
use super::messages::{
    AudioFrame, ConversationTurn, GenerationId, LlmRequest, Speaker, TranscriptSegment,
};
use super::transcript::TranscriptLog;
use super::turn::{GenerationRequest, TurnAction, TurnController, TurnInput};
use crate::audio::{AudioFrameBus, LossMonitor, MediaTransport, Outbound, SequenceVerdict};
use crate::call::{Call, CallId, CallSummary, EndReason};
use crate::config::AgentConfig;
use crate::error::{Result, StageError, TransportError};
use crate::fleet::NodeId;
use crate::memory::{self, CallerMemory, CallerProfile};
use crate::persistence::{MetadataRecord, PersistenceForwarder};
use crate::runtime::RuntimeEvent;
use crate::stage::{FrameStream, RetryPolicy, StageRun, StageSet, SttStage};
use crate::telephony::{SignalingEvent, TelephonyCommand, TelephonyLink};
use crate::vad::{VadEvent, VoiceActivityDetector};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffered frames between the inbound pump and STT.
const STT_RELAY_CAPACITY: usize = 64;

/// Everything the session loop reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    /// Input for the turn controller.
    Turn(TurnInput),
    /// VAD result for a caller frame received from the transport at `received_at`.
    Vad { event: VadEvent, received_at: Instant },
    /// A response cycle finished (or was cut off) having said `text`.
    AgentReply {
        generation: GenerationId,
        text: String,
        interrupted: bool,
    },
    /// A response cycle failed in a way that ends the call.
    GenerationFailed {
        generation: GenerationId,
        error: StageError,
    },
    /// STT failed fatally or exhausted its restarts.
    SttFailed(StageError),
    /// The media stream degraded beyond the loss threshold or closed on send.
    TransportLost(String),
    /// The inbound media stream ended.
    MediaEnded,
    /// Toggle barge-in for future responses.
    SetAllowInterruptions(bool),
}

/// Control handle for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    /// Toggle barge-in for responses started from now on.
    pub fn set_allow_interruptions(&self, allow: bool) {
        let _ = self.events.send(SessionEvent::SetAllowInterruptions(allow));
    }

    /// End the call with [`EndReason::Shutdown`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Runs one call end to end.
pub struct SessionOrchestrator {
    config: AgentConfig,
    call: Call,
    stages: StageSet,
    transport: Arc<dyn MediaTransport>,
    bus: Arc<AudioFrameBus>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    persistence: Arc<PersistenceForwarder>,
    memory: Option<Arc<dyn CallerMemory>>,
    /// System instructions, enriched with caller memory once answered.
    instructions: String,
    telephony: Option<TelephonyLink>,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Mutable state owned by the session loop.
struct SessionState {
    controller: TurnController,
    transcript: TranscriptLog,
    history: VecDeque<ConversationTurn>,
    /// Generation whose reply is the newest agent turn in `history`.
    last_reply: Option<GenerationId>,
    generation: Option<GenerationTask>,
    teardowns: Vec<JoinHandle<()>>,
    end_reason: Option<EndReason>,
}

impl SessionOrchestrator {
    /// Create a session for `call_id` over `transport`.
    pub fn new(
        config: AgentConfig,
        call_id: CallId,
        stages: StageSet,
        transport: Arc<dyn MediaTransport>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(AudioFrameBus::new(config.transport.outbound_queue_frames));
        Self {
            call: Call::new(call_id, None),
            instructions: config.agent.system_instructions.clone(),
            config,
            stages,
            transport,
            bus,
            runtime_tx: None,
            persistence: Arc::new(PersistenceForwarder::disabled()),
            memory: None,
            telephony: None,
            cancel: CancellationToken::new(),
            events_tx,
            events_rx,
        }
    }

    /// Record the worker hosting this call.
    pub fn with_worker(mut self, node: NodeId) -> Self {
        self.call.worker = Some(node);
        self
    }

    /// Broadcast runtime events for observability.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    /// Persist recordings, transcripts and metadata through `forwarder`.
    ///
    /// The forwarder may be shared between calls; the session never closes it.
    pub fn with_persistence(mut self, forwarder: Arc<PersistenceForwarder>) -> Self {
        self.persistence = forwarder;
        self
    }

    /// Caller phone number as reported by telephony.
    pub fn with_caller(mut self, number: impl Into<String>) -> Self {
        self.call.caller = Some(number.into());
        self
    }

    /// Recall earlier calls from the same number and remember this one.
    ///
    /// Has no effect unless the caller number is known.
    pub fn with_caller_memory(mut self, store: Arc<dyn CallerMemory>) -> Self {
        self.memory = Some(store);
        self
    }

    /// Follow the call lifecycle from telephony signaling.
    ///
    /// Without a link, the call is treated as already answered.
    pub fn with_telephony(mut self, link: TelephonyLink) -> Self {
        self.telephony = Some(link);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that ends the call with [`EndReason::Shutdown`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Control handle for the running session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
            events: self.events_tx.clone(),
        }
    }

    /// The call this session runs.
    pub fn call_id(&self) -> &CallId {
        &self.call.id
    }

    /// Run the call until it ends and return its summary.
    pub async fn run(mut self) -> Result<CallSummary> {
        let call_id = self.call.id.clone();
        info!(call_id = %call_id, worker = ?self.call.worker, "call session starting");
        self.persistence.metadata(
            &call_id,
            MetadataRecord::CallStarted {
                at: self.call.created_at,
                worker: self.call.worker.clone(),
            },
        );

        let mut state = SessionState {
            controller: TurnController::new(self.config.turn.clone()),
            transcript: TranscriptLog::new(),
            history: VecDeque::new(),
            last_reply: None,
            generation: None,
            teardowns: Vec::new(),
            end_reason: None,
        };

        let media_token = self.cancel.child_token();
        let mut media_tasks = Vec::new();
        let mut profile = None;

        match self.await_answer().await {
            Some(reason) => {
                info!(call_id = %call_id, reason = %reason, "call ended before media started");
                state.end_reason = Some(reason);
            }
            None => {
                self.call.answered_at = Some(Utc::now());
                profile = self.recall_caller().await;
                info!(call_id = %call_id, "call answered; media processing started");
                media_tasks = self.spawn_media_tasks(&media_token);
                self.run_loop(&mut state).await;
            }
        }

        // Teardown: unblock producers, then wait for every response cycle.
        self.bus.close();
        if let Some(task) = state.generation.take() {
            task.cancel();
            task.join().await;
        }
        for teardown in state.teardowns.drain(..) {
            let _ = teardown.await;
        }
        media_token.cancel();
        for task in media_tasks {
            if let Err(e) = task.await {
                warn!(call_id = %call_id, "media task failed: {e}");
            }
        }

        let reason = state.end_reason.take().unwrap_or(EndReason::Shutdown);
        self.call.end(reason.clone());
        if let Some(profile) = profile {
            self.remember_caller(profile, &state.history).await;
        }
        self.finish(&reason).await;

        let stats = self.bus.stats();
        info!(
            call_id = %call_id,
            reason = %reason,
            generations = state.controller.generations_started(),
            interruptions = state.controller.interruptions(),
            frames_sent = stats.outbound_sent,
            "call session ended"
        );

        Ok(CallSummary {
            call: self.call,
            transitions: state.controller.transitions().to_vec(),
            transcript: state.transcript.lines(),
            generations: state.controller.generations_started(),
            interruptions: state.controller.interruptions(),
            frames_sent: stats.outbound_sent,
            frames_discarded: stats.outbound_discarded,
        })
    }

    /// Wait for `Answered`. Returns the end reason if the call ends first.
    async fn await_answer(&mut self) -> Option<EndReason> {
        // No signaling link: media is already flowing.
        let link = self.telephony.as_mut()?;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Some(EndReason::Shutdown),
                event = link.events.recv() => match event {
                    Some(SignalingEvent::Ringing) => debug!(call_id = %self.call.id, "ringing"),
                    Some(SignalingEvent::Answered) => return None,
                    Some(SignalingEvent::HungUp) => return Some(EndReason::Unanswered),
                    Some(SignalingEvent::Transferred { destination }) => {
                        return Some(EndReason::Transferred { destination });
                    }
                    None => {
                        return Some(EndReason::TransportLost {
                            detail: "signaling closed before answer".into(),
                        });
                    }
                },
            }
        }
    }

    /// Load the caller's profile and fold it into the system instructions.
    ///
    /// Returns the profile to update when the call ends, or `None` when memory
    /// is off or the caller is unknown. Store failures never fail the call.
    async fn recall_caller(&mut self) -> Option<CallerProfile> {
        let store = self.memory.as_ref()?;
        let caller = self.call.caller.as_deref().and_then(memory::normalize_caller)?;
        let profile = match store.load(&caller).await {
            Ok(Some(profile)) => profile,
            Ok(None) => CallerProfile::new(caller, Utc::now()),
            Err(e) => {
                warn!(call_id = %self.call.id, "caller memory unavailable: {e}");
                return None;
            }
        };
        info!(
            call_id = %self.call.id,
            previous_calls = profile.total_calls,
            "caller memory loaded"
        );
        self.instructions = memory::enhance_instructions(
            &self.config.agent.system_instructions,
            Some(&profile),
            self.config.memory.max_notes_in_prompt,
        );
        Some(profile)
    }

    async fn remember_caller(&self, mut profile: CallerProfile, history: &VecDeque<ConversationTurn>) {
        let Some(store) = &self.memory else {
            return;
        };
        let turns: Vec<ConversationTurn> = history.iter().cloned().collect();
        let summary = memory::summarize_call(&turns, self.config.memory.summary_max_chars);
        profile.record_call(
            summary,
            self.call.ended_at.unwrap_or_else(Utc::now),
            self.config.memory.max_notes_kept,
        );
        match store.save(&profile).await {
            Ok(()) => debug!(call_id = %self.call.id, calls = profile.total_calls, "caller memory saved"),
            Err(e) => warn!(call_id = %self.call.id, "failed to save caller memory: {e}"),
        }
    }

    fn spawn_media_tasks(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let (stt_tx, stt_rx) = mpsc::channel(self.config.transport.inbound_queue_frames.max(1));
        let inbound = InboundStage {
            call_id: self.call.id.clone(),
            transport: Arc::clone(&self.transport),
            bus: Arc::clone(&self.bus),
            vad: VoiceActivityDetector::new(&self.config.vad),
            loss: LossMonitor::new(&self.config.transport),
            stt_tx,
            events: self.events_tx.clone(),
            persistence: Arc::clone(&self.persistence),
        };
        let outbound = OutboundStage {
            call_id: self.call.id.clone(),
            transport: Arc::clone(&self.transport),
            bus: Arc::clone(&self.bus),
            loss: LossMonitor::new(&self.config.transport),
            events: self.events_tx.clone(),
            persistence: Arc::clone(&self.persistence),
        };
        vec![
            tokio::spawn(run_inbound_stage(inbound, token.clone())),
            tokio::spawn(run_stt_stage(
                Arc::clone(&self.stages.stt),
                stt_rx,
                self.events_tx.clone(),
                RetryPolicy::from(&self.config.retry),
                token.clone(),
            )),
            tokio::spawn(run_outbound_stage(outbound, token.clone())),
        ]
    }

    /// Serialize every event through the turn controller until the call ends.
    async fn run_loop(&mut self, state: &mut SessionState) {
        let mut signaling_open = self.telephony.is_some();
        while !state.controller.is_terminated() {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.terminate(state, EndReason::Shutdown).await;
                }
                event = next_signal(&mut self.telephony), if signaling_open => match event {
                    Some(SignalingEvent::HungUp) => self.terminate(state, EndReason::HungUp).await,
                    Some(SignalingEvent::Transferred { destination }) => {
                        self.terminate(state, EndReason::Transferred { destination }).await;
                    }
                    Some(other) => debug!(call_id = %self.call.id, ?other, "signaling event ignored"),
                    None => signaling_open = false,
                },
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(state, event).await,
                    None => self.terminate(state, EndReason::Shutdown).await,
                },
            }
        }
    }

    async fn handle_event(&mut self, state: &mut SessionState, event: SessionEvent) {
        match event {
            SessionEvent::Turn(input) => {
                if let TurnInput::Transcript(segment) = &input {
                    self.record_transcript(state, segment);
                }
                let actions = state.controller.handle(input);
                self.apply(state, actions, None).await;
            }
            SessionEvent::Vad { event, received_at } => {
                let actions = state.controller.handle(TurnInput::Vad(event));
                self.apply(state, actions, Some(received_at)).await;
            }
            SessionEvent::AgentReply {
                generation,
                text,
                interrupted,
            } => {
                if text.is_empty() {
                    return;
                }
                self.emit(RuntimeEvent::AgentText {
                    call_id: self.call.id.clone(),
                    generation,
                    text: text.clone(),
                });
                push_history(
                    state,
                    ConversationTurn {
                        speaker: Speaker::Agent,
                        text,
                        interrupted,
                    },
                    self.config.agent.max_history_turns,
                );
                state.last_reply = Some(generation);
            }
            SessionEvent::GenerationFailed { generation, error } => {
                if state.controller.active_generation() == Some(generation) {
                    error!(call_id = %self.call.id, generation = %generation, "response failed: {error}");
                    let detail = error.to_string();
                    self.terminate(state, EndReason::ProviderFailure { detail }).await;
                }
            }
            SessionEvent::SttFailed(error) => {
                error!(call_id = %self.call.id, "speech recognition failed: {error}");
                let detail = error.to_string();
                self.terminate(state, EndReason::ProviderFailure { detail }).await;
            }
            SessionEvent::TransportLost(detail) => {
                error!(call_id = %self.call.id, "transport lost: {detail}");
                self.terminate(state, EndReason::TransportLost { detail }).await;
            }
            SessionEvent::MediaEnded => {
                info!(call_id = %self.call.id, "inbound media ended");
                self.terminate(state, EndReason::HungUp).await;
            }
            SessionEvent::SetAllowInterruptions(allow) => {
                info!(call_id = %self.call.id, allow, "interruptions toggled");
                state.controller.set_allow_interruptions(allow);
            }
        }
    }

    async fn terminate(&mut self, state: &mut SessionState, reason: EndReason) {
        let actions = state.controller.handle(TurnInput::Terminate(reason));
        self.apply(state, actions, None).await;
    }

    /// Carry out controller actions. `trigger` is when the input behind them
    /// reached the session from the transport, if it came from caller audio.
    async fn apply(
        &mut self,
        state: &mut SessionState,
        actions: Vec<TurnAction>,
        trigger: Option<Instant>,
    ) {
        let mut barge_in_at: Option<Instant> = None;
        for action in actions {
            match action {
                TurnAction::Transitioned(transition) => {
                    self.call.turn_state = transition.to;
                    self.persistence
                        .metadata(&self.call.id, MetadataRecord::Transition(transition.clone()));
                    self.emit(RuntimeEvent::TurnChanged {
                        call_id: self.call.id.clone(),
                        transition,
                    });
                }
                TurnAction::StartGeneration(request) => self.start_generation(state, request).await,
                TurnAction::CancelGeneration(id) => {
                    barge_in_at = Some(trigger.unwrap_or_else(Instant::now));
                    self.cancel_generation(state, id);
                }
                TurnAction::DiscardOutbound(id) => {
                    let discarded = self.bus.truncate(id);
                    if let Some(started) = barge_in_at.take()
                        && !state.controller.is_terminated()
                    {
                        // The reply may already be recorded if only playout was cut.
                        if state.last_reply == Some(id)
                            && let Some(turn) = state.history.back_mut()
                        {
                            turn.interrupted = true;
                        }
                        let truncation_latency = started.elapsed();
                        info!(
                            call_id = %self.call.id,
                            generation = %id,
                            discarded,
                            truncation_latency_us = truncation_latency.as_micros() as u64,
                            "barge-in: response cancelled and outbound audio truncated"
                        );
                        self.emit(RuntimeEvent::Interruption {
                            call_id: self.call.id.clone(),
                            generation: id,
                            truncation_latency,
                            frames_discarded: discarded,
                        });
                    }
                }
                TurnAction::End(reason) => {
                    state.end_reason = Some(reason);
                }
            }
        }
    }

    async fn start_generation(&mut self, state: &mut SessionState, request: GenerationRequest) {
        // Teardown of the previous cycle completes before a new one starts.
        if let Some(previous) = state.generation.take() {
            previous.join().await;
        }

        let history: Vec<ConversationTurn> = state.history.iter().cloned().collect();
        push_history(
            state,
            ConversationTurn {
                speaker: Speaker::Caller,
                text: request.utterance.text.clone(),
                interrupted: false,
            },
            self.config.agent.max_history_turns,
        );
        let llm_request = LlmRequest {
            system_instructions: self.instructions.clone(),
            history,
            utterance: request.utterance,
        };

        let ctx = GenerationContext {
            stages: self.stages.clone(),
            bus: Arc::clone(&self.bus),
            events: self.events_tx.clone(),
            retry: RetryPolicy::from(&self.config.retry),
            fallback_response: self.config.agent.fallback_response.clone(),
        };
        info!(
            call_id = %self.call.id,
            generation = %request.id,
            interruptible = request.interruptible,
            "starting response"
        );
        state.generation = Some(GenerationTask::spawn(
            ctx,
            request.id,
            request.interruptible,
            llm_request,
            &self.cancel,
        ));
    }

    /// Signal cancellation and report completion once teardown finishes.
    fn cancel_generation(&mut self, state: &mut SessionState, id: GenerationId) {
        let Some(task) = state.generation.take_if(|task| task.id() == id) else {
            debug!(call_id = %self.call.id, generation = %id, "cancel for inactive generation ignored");
            return;
        };
        task.cancel();
        let events = self.events_tx.clone();
        state.teardowns.retain(|handle| !handle.is_finished());
        state.teardowns.push(tokio::spawn(async move {
            task.join().await;
            let _ = events.send(SessionEvent::Turn(TurnInput::CancellationComplete(id)));
        }));
    }

    fn record_transcript(&self, state: &mut SessionState, segment: &TranscriptSegment) {
        state.transcript.apply(segment.clone());
        self.persistence.transcript(&self.call.id, segment);
        self.emit(RuntimeEvent::Transcript {
            call_id: self.call.id.clone(),
            segment: segment.clone(),
        });
    }

    /// Report the end of the call to telephony, persistence and observers.
    async fn finish(&self, reason: &EndReason) {
        if reason.is_fatal()
            && let Some(link) = &self.telephony
        {
            let command = TelephonyCommand::HangUp {
                call_id: self.call.id.clone(),
                reason: reason.clone(),
            };
            if let Err(e) = link.commands.send(command).await {
                warn!(call_id = %self.call.id, "failed to send hang-up to telephony: {e}");
            }
        }

        self.persistence.metadata(
            &self.call.id,
            MetadataRecord::CallEnded {
                at: self.call.ended_at.unwrap_or_else(Utc::now),
                reason: reason.clone(),
                answered: self.call.answered_at.is_some(),
            },
        );

        self.emit(RuntimeEvent::CallEnded {
            call_id: self.call.id.clone(),
            reason: reason.clone(),
        });
    }

    fn emit(&self, event: RuntimeEvent) {
        if let Some(tx) = &self.runtime_tx {
            let _ = tx.send(event);
        }
    }
}

async fn next_signal(link: &mut Option<TelephonyLink>) -> Option<SignalingEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => None,
    }
}

fn push_history(state: &mut SessionState, turn: ConversationTurn, max_turns: usize) {
    state.history.push_back(turn);
    while state.history.len() > max_turns {
        state.history.pop_front();
    }
}

// ── Stage runners ─────────────────────────────────────────────────────

struct InboundStage {
    call_id: CallId,
    transport: Arc<dyn MediaTransport>,
    bus: Arc<AudioFrameBus>,
    vad: VoiceActivityDetector,
    loss: LossMonitor,
    stt_tx: mpsc::Sender<AudioFrame>,
    events: mpsc::UnboundedSender<SessionEvent>,
    persistence: Arc<PersistenceForwarder>,
}

/// Transport → sequencer → VAD (+ STT relay).
async fn run_inbound_stage(mut stage: InboundStage, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = stage.transport.receive() => frame,
        };
        let Some(frame) = frame else {
            let _ = stage.events.send(SessionEvent::MediaEnded);
            break;
        };
        let received_at = Instant::now();

        match stage.bus.admit_inbound(&frame) {
            SequenceVerdict::Rejected => continue,
            SequenceVerdict::Accepted { lost } => {
                if lost > 0 {
                    stage.loss.record_lost(lost);
                }
                stage.loss.record_delivered();
            }
        }
        if stage.loss.is_dead() {
            let detail = format!("inbound loss ratio {:.2}", stage.loss.loss_ratio());
            let _ = stage.events.send(SessionEvent::TransportLost(detail));
            break;
        }

        stage.persistence.audio(&stage.call_id, &frame);
        let event = stage.vad.process_frame(&frame);
        let _ = stage.events.send(SessionEvent::Vad { event, received_at });
        if let Err(mpsc::error::TrySendError::Full(frame)) = stage.stt_tx.try_send(frame) {
            debug!(call_id = %stage.call_id, sequence = frame.sequence, "stt input full; frame dropped");
        }
    }
    debug!(call_id = %stage.call_id, "inbound stage exiting");
}

/// Relay inbound frames into STT, restarting it after transient failures.
async fn run_stt_stage(
    stt: Arc<SttStage>,
    mut frames: mpsc::Receiver<AudioFrame>,
    events: mpsc::UnboundedSender<SessionEvent>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) {
    let mut failures = 0_u32;
    loop {
        let (relay_tx, relay_rx) = mpsc::channel(STT_RELAY_CAPACITY);
        let input: FrameStream = Box::pin(ReceiverStream::new(relay_rx));
        let failure = match StageRun::start(&*stt, input, &cancel).await {
            Ok(mut run) => loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    frame = frames.recv() => match frame {
                        Some(frame) => {
                            if relay_tx.try_send(frame).is_err() {
                                debug!("stt relay full; frame dropped");
                            }
                        }
                        None => return,
                    },
                    item = run.next() => match item {
                        Some(Ok(segment)) => {
                            failures = 0;
                            let _ = events.send(SessionEvent::Turn(TurnInput::Transcript(segment)));
                        }
                        Some(Err(e)) => break e,
                        None if cancel.is_cancelled() => return,
                        None => break StageError::transient(stt.kind(), "stream ended unexpectedly"),
                    },
                }
            },
            Err(e) => e,
        };

        if failure.cancelled {
            return;
        }
        failures = failures.saturating_add(1);
        if !failure.is_retryable() || failures >= retry.attempts {
            let _ = events.send(SessionEvent::SttFailed(failure));
            return;
        }
        let delay = retry.delay_for_attempt(failures);
        warn!(attempt = failures, delay_ms = delay.as_millis() as u64, "restarting stt: {failure}");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

struct OutboundStage {
    call_id: CallId,
    transport: Arc<dyn MediaTransport>,
    bus: Arc<AudioFrameBus>,
    loss: LossMonitor,
    events: mpsc::UnboundedSender<SessionEvent>,
    persistence: Arc<PersistenceForwarder>,
}

/// Bus queue → transport, reporting when each response has been flushed.
async fn run_outbound_stage(mut stage: OutboundStage, cancel: CancellationToken) {
    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = stage.bus.next_outbound() => item,
        };
        let Some(item) = item else {
            break;
        };
        match item {
            Outbound::Frame { frame, .. } => {
                stage.persistence.audio(&stage.call_id, &frame);
                match stage.transport.send(frame).await {
                    Ok(()) => {
                        stage.bus.record_sent();
                        stage.loss.record_delivered();
                    }
                    Err(TransportError::Closed) => {
                        let _ = stage
                            .events
                            .send(SessionEvent::TransportLost("outbound transport closed".into()));
                        break;
                    }
                    Err(e) => {
                        warn!(call_id = %stage.call_id, "outbound frame lost: {e}");
                        stage.loss.record_lost(1);
                        if stage.loss.is_dead() {
                            let detail = format!("outbound loss ratio {:.2}", stage.loss.loss_ratio());
                            let _ = stage.events.send(SessionEvent::TransportLost(detail));
                            break;
                        }
                    }
                }
            }
            Outbound::EndOfGeneration(id) => {
                let _ = stage
                    .events
                    .send(SessionEvent::Turn(TurnInput::GenerationFlushed(id)));
            }
        }
    }
    debug!(call_id = %stage.call_id, "outbound stage exiting");
}
