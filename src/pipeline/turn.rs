//! Turn-taking and interruption state machine.
//!
//! [`TurnController`] is a pure, synchronous state machine: the session feeds it
//! [`TurnInput`]s one at a time and executes the [`TurnAction`]s it returns.
//! Serializing all inputs through one owner is what guarantees a single
//! transition evaluation at a time.
//!
//! ```text
//!            speech ≥ min_interruption              silence ≥ endpointing + final
//!   Idle ─────────────────────────────▶ UserSpeaking ─────────────────────────▶ AgentProcessing
//!    ▲                                       ▲                                          │
//!    │ response flushed                      │ cancellation complete                    │ first TTS frame
//!    │                                       │                                          ▼
//!    └────────────────────────────── AgentSpeaking ──────────────────────────▶ Interrupted
//!                                               speech ≥ min_interruption (barge-in)
//! ```
//!
//! Any state moves to `Idle` on termination, after which every input is ignored.

use crate::call::EndReason;
use crate::config::TurnConfig;
use crate::pipeline::messages::{GenerationId, TranscriptSegment};
use crate::vad::VadEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Who holds the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// No audio activity.
    Idle,
    /// The caller is talking.
    UserSpeaking,
    /// An utterance was finalized; LLM+TTS is running but no audio has been emitted.
    AgentProcessing,
    /// TTS audio is being emitted to the caller.
    AgentSpeaking,
    /// The caller started talking over the agent; cancellation is in progress.
    Interrupted,
}

impl TurnState {
    /// Whether `self → next` is one of the non-terminal edges.
    pub fn has_edge_to(self, next: TurnState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::UserSpeaking)
                | (Self::UserSpeaking, Self::AgentProcessing)
                | (Self::AgentProcessing, Self::AgentSpeaking)
                | (Self::AgentSpeaking, Self::Idle)
                | (Self::AgentSpeaking, Self::Interrupted)
                | (Self::Interrupted, Self::UserSpeaking)
        )
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::UserSpeaking => "user_speaking",
            Self::AgentProcessing => "agent_processing",
            Self::AgentSpeaking => "agent_speaking",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Contiguous caller speech reached the minimum duration.
    SpeechDetected,
    /// Endpointing silence elapsed and STT finalized the utterance.
    EndOfUtterance,
    /// TTS emitted the first frame of the response.
    FirstAudio,
    /// The last frame of the response reached the transport.
    ResponseFlushed,
    /// The caller talked over the agent.
    BargeIn,
    /// Teardown of the cancelled response finished.
    CancellationComplete,
    /// The call ended.
    Terminated,
}

/// A recorded TurnState change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Previous state.
    pub from: TurnState,
    /// New state.
    pub to: TurnState,
    /// Why it happened.
    pub cause: TransitionCause,
    /// Wall-clock time of the change.
    pub at: DateTime<Utc>,
}

/// A new response cycle the session must start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Identifier of the cycle.
    pub id: GenerationId,
    /// The finalized caller utterance.
    pub utterance: TranscriptSegment,
    /// Whether barge-in may cancel this response.
    pub interruptible: bool,
}

/// Events the controller reacts to.
#[derive(Debug, Clone)]
pub enum TurnInput {
    /// Activity report for one inbound frame.
    Vad(VadEvent),
    /// Partial or final STT result.
    Transcript(TranscriptSegment),
    /// TTS produced the first frame of a response.
    FirstAudio(GenerationId),
    /// The final frame of a response reached the transport.
    GenerationFlushed(GenerationId),
    /// A cancelled response finished tearing down.
    CancellationComplete(GenerationId),
    /// End the call.
    Terminate(EndReason),
}

/// Side effects requested by the controller, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnAction {
    /// The floor changed hands.
    Transitioned(Transition),
    /// Start a new LLM+TTS cycle.
    StartGeneration(GenerationRequest),
    /// Cancel an in-flight cycle.
    CancelGeneration(GenerationId),
    /// Drop queued, unplayed outbound audio of a generation.
    DiscardOutbound(GenerationId),
    /// The call is over.
    End(EndReason),
}

#[derive(Debug, Clone, Copy)]
struct ActiveGeneration {
    id: GenerationId,
    interruptible: bool,
}

/// Per-call turn-taking state machine.
pub struct TurnController {
    config: TurnConfig,
    state: TurnState,
    active: Option<ActiveGeneration>,
    cancelling: Option<GenerationId>,
    next_generation: u64,
    /// Contiguous speech reported by the last speech event.
    speech_run: Duration,
    /// Contiguous silence reported by the last silence event.
    silence_run: Duration,
    /// Final segments that make up the utterance in progress.
    pending: Vec<TranscriptSegment>,
    transitions: Vec<Transition>,
    interruptions: u32,
    terminated: bool,
}

impl TurnController {
    /// Create a controller in the `Idle` state.
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            state: TurnState::Idle,
            active: None,
            cancelling: None,
            next_generation: 0,
            speech_run: Duration::ZERO,
            silence_run: Duration::ZERO,
            pending: Vec::new(),
            transitions: Vec::new(),
            interruptions: 0,
            terminated: false,
        }
    }

    /// Current floor holder.
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// The in-flight generation, if any.
    pub fn active_generation(&self) -> Option<GenerationId> {
        self.active.map(|a| a.id)
    }

    /// Every transition so far, in order.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Number of generations started.
    pub fn generations_started(&self) -> u64 {
        self.next_generation
    }

    /// Number of barge-ins that cancelled a response.
    pub fn interruptions(&self) -> u32 {
        self.interruptions
    }

    /// Whether the call has ended.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Toggle barge-in for responses started from now on.
    ///
    /// A response already in flight keeps the setting it started with.
    pub fn set_allow_interruptions(&mut self, allow: bool) {
        self.config.allow_interruptions = allow;
    }

    /// Evaluate one input and return the actions to execute.
    pub fn handle(&mut self, input: TurnInput) -> Vec<TurnAction> {
        let mut actions = Vec::new();
        if self.terminated {
            debug!("turn input after termination ignored: {input:?}");
            return actions;
        }

        match input {
            TurnInput::Vad(event) => self.on_vad(event, &mut actions),
            TurnInput::Transcript(segment) => self.on_transcript(segment, &mut actions),
            TurnInput::FirstAudio(id) => {
                if self.is_active(id) && self.state == TurnState::AgentProcessing {
                    self.transition(TurnState::AgentSpeaking, TransitionCause::FirstAudio, &mut actions);
                }
            }
            TurnInput::GenerationFlushed(id) => {
                if self.is_active(id) && self.state == TurnState::AgentSpeaking {
                    self.active = None;
                    self.transition(TurnState::Idle, TransitionCause::ResponseFlushed, &mut actions);
                } else if self.is_active(id) {
                    warn!(generation = %id, state = %self.state, "response flushed before any audio");
                }
            }
            TurnInput::CancellationComplete(id) => {
                if self.cancelling == Some(id) {
                    self.cancelling = None;
                    if self.state == TurnState::Interrupted {
                        self.transition(
                            TurnState::UserSpeaking,
                            TransitionCause::CancellationComplete,
                            &mut actions,
                        );
                        // The caller may already have gone quiet while teardown ran.
                        self.try_endpoint(&mut actions);
                    }
                }
            }
            TurnInput::Terminate(reason) => self.terminate(reason, &mut actions),
        }

        actions
    }

    fn on_vad(&mut self, event: VadEvent, actions: &mut Vec<TurnAction>) {
        if event.is_speech() {
            self.silence_run = Duration::ZERO;
            self.speech_run = event.contiguous;
            let long_enough = self.speech_run >= self.config.min_interruption_duration();

            match self.state {
                TurnState::Idle if long_enough && self.active.is_none() => {
                    self.transition(TurnState::UserSpeaking, TransitionCause::SpeechDetected, actions);
                }
                TurnState::AgentSpeaking if long_enough => self.try_barge_in(actions),
                _ => {}
            }
        } else {
            self.speech_run = Duration::ZERO;
            self.silence_run = event.contiguous;
            self.try_endpoint(actions);
        }
    }

    fn on_transcript(&mut self, segment: TranscriptSegment, actions: &mut Vec<TurnAction>) {
        if !segment.is_final || segment.text.trim().is_empty() {
            return;
        }
        match self.state {
            TurnState::AgentProcessing | TurnState::AgentSpeaking => {
                debug!(state = %self.state, "final transcript while agent holds the floor not queued");
            }
            _ => {
                self.pending.push(segment);
                self.try_endpoint(actions);
            }
        }
    }

    fn try_barge_in(&mut self, actions: &mut Vec<TurnAction>) {
        let Some(active) = self.active else {
            return;
        };
        if !self.config.allow_interruptions || !active.interruptible {
            return;
        }
        self.active = None;
        self.cancelling = Some(active.id);
        self.interruptions += 1;
        self.transition(TurnState::Interrupted, TransitionCause::BargeIn, actions);
        actions.push(TurnAction::CancelGeneration(active.id));
        actions.push(TurnAction::DiscardOutbound(active.id));
    }

    /// STT finalization is authoritative; VAD silence only starts the timer.
    fn try_endpoint(&mut self, actions: &mut Vec<TurnAction>) {
        if self.state != TurnState::UserSpeaking
            || self.pending.is_empty()
            || self.silence_run < self.config.min_endpointing_delay()
            || self.active.is_some()
            || self.cancelling.is_some()
        {
            return;
        }
        let Some(utterance) = TranscriptSegment::merge(&self.pending) else {
            return;
        };
        self.pending.clear();

        let id = GenerationId(self.next_generation);
        self.next_generation += 1;
        let interruptible = self.config.allow_interruptions;
        self.active = Some(ActiveGeneration { id, interruptible });

        self.transition(TurnState::AgentProcessing, TransitionCause::EndOfUtterance, actions);
        actions.push(TurnAction::StartGeneration(GenerationRequest {
            id,
            utterance,
            interruptible,
        }));
    }

    fn terminate(&mut self, reason: EndReason, actions: &mut Vec<TurnAction>) {
        if let Some(active) = self.active.take() {
            actions.push(TurnAction::CancelGeneration(active.id));
            actions.push(TurnAction::DiscardOutbound(active.id));
        }
        if self.state != TurnState::Idle {
            self.transition(TurnState::Idle, TransitionCause::Terminated, actions);
        }
        self.pending.clear();
        self.terminated = true;
        info!(reason = %reason, "turn controller terminated");
        actions.push(TurnAction::End(reason));
    }

    fn is_active(&self, id: GenerationId) -> bool {
        self.active.is_some_and(|a| a.id == id)
    }

    fn transition(&mut self, to: TurnState, cause: TransitionCause, actions: &mut Vec<TurnAction>) {
        let from = self.state;
        debug_assert!(
            from.has_edge_to(to) || (cause == TransitionCause::Terminated && to == TurnState::Idle),
            "illegal turn transition {from} -> {to}"
        );
        self.state = to;
        info!(from = %from, to = %to, ?cause, "turn transition");
        let transition = Transition {
            from,
            to,
            cause,
            at: Utc::now(),
        };
        self.transitions.push(transition.clone());
        actions.push(TurnAction::Transitioned(transition));
    }
}
