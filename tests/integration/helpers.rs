//! Shared helpers for integration tests.
//!
//! A [`TestCall`] runs one session over an in-process transport with scripted
//! providers, and a [`Caller`] plays caller audio into it faster than real time.

use siphon::audio::{CallerEnd, ChannelTransport};
use siphon::config::AgentConfig;
use siphon::pipeline::messages::{AudioFrame, Direction};
use siphon::pipeline::turn::TurnState;
use siphon::stage::StageSet;
use siphon::stage::scripted::{ScriptedLlm, ScriptedStt, ScriptedTts};
use siphon::{CallId, CallSummary, RuntimeEvent, SessionHandle, SessionOrchestrator};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Media time per caller frame.
pub(crate) const FRAME_MS: u64 = 20;
/// Wall-clock time between caller frames.
const FRAME_PACE: Duration = Duration::from_millis(10);
/// Upper bound for any single wait in these tests.
pub(crate) const WAIT: Duration = Duration::from_secs(10);

/// Default configuration with fast retries.
pub(crate) fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.retry.initial_backoff_ms = 5;
    config.retry.max_backoff_ms = 20;
    config.retry.jitter = false;
    config
}

/// Scripted providers. The LLM is returned separately to inspect requests.
pub(crate) fn scripted_stages(
    config: &AgentConfig,
    utterances: &[&str],
    responses: &[&str],
) -> (StageSet, Arc<ScriptedLlm>) {
    let llm = Arc::new(ScriptedLlm::new(responses.iter().copied()).with_token_delay(Duration::from_millis(2)));
    let stages = StageSet {
        stt: Arc::new(ScriptedStt::new(utterances.iter().copied(), config.vad.clone())),
        llm: llm.clone(),
        tts: Arc::new(ScriptedTts::new(config.vad.sample_rate)),
    };
    (stages, llm)
}

/// The simulated caller.
pub(crate) struct Caller {
    speak: Option<mpsc::Sender<AudioFrame>>,
    listener: Option<JoinHandle<Vec<AudioFrame>>>,
    heard: Arc<Mutex<usize>>,
    sequence: u64,
    sample_rate: u32,
}

impl Caller {
    fn new(end: CallerEnd, sample_rate: u32) -> Self {
        let CallerEnd { speak, mut hear } = end;
        let heard = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&heard);
        let listener = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = hear.recv().await {
                *counter.lock().unwrap() += 1;
                frames.push(frame);
            }
            frames
        });
        Self {
            speak: Some(speak),
            listener: Some(listener),
            heard,
            sequence: 0,
            sample_rate,
        }
    }

    /// Speak for `ms` of media time.
    pub(crate) async fn speak(&mut self, ms: u64) {
        self.play(ms, 8_000).await;
    }

    /// Stay quiet for `ms` of media time.
    pub(crate) async fn silence(&mut self, ms: u64) {
        self.play(ms, 0).await;
    }

    /// Send one frame with an explicit sequence number.
    pub(crate) async fn send_with_sequence(&mut self, sequence: u64) {
        let frame = self.frame(sequence, 0);
        if let Some(speak) = &self.speak {
            let _ = speak.send(frame).await;
        }
        self.sequence = sequence + 1;
        tokio::time::sleep(FRAME_PACE).await;
    }

    /// Frames heard so far.
    pub(crate) fn heard_count(&self) -> usize {
        *self.heard.lock().unwrap()
    }

    /// End the inbound media stream.
    pub(crate) fn hang_up(&mut self) {
        self.speak = None;
    }

    /// Every frame heard, once the session has released the transport.
    pub(crate) async fn heard(&mut self) -> Vec<AudioFrame> {
        match self.listener.take() {
            Some(listener) => tokio::time::timeout(WAIT, listener)
                .await
                .expect("transport should close after the call")
                .unwrap(),
            None => Vec::new(),
        }
    }

    async fn play(&mut self, ms: u64, amplitude: i16) {
        for _ in 0..ms / FRAME_MS {
            let frame = self.frame(self.sequence, amplitude);
            self.sequence += 1;
            let Some(speak) = &self.speak else { return };
            if speak.send(frame).await.is_err() {
                return;
            }
            tokio::time::sleep(FRAME_PACE).await;
        }
    }

    fn frame(&self, sequence: u64, amplitude: i16) -> AudioFrame {
        let len = (u64::from(self.sample_rate) * FRAME_MS / 1_000) as usize;
        let samples: Vec<i16> = (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        AudioFrame::from_pcm16(
            Direction::Inbound,
            sequence,
            Duration::from_millis(sequence * FRAME_MS),
            self.sample_rate,
            &samples,
        )
    }
}

/// A running session plus everything needed to drive and observe it.
pub(crate) struct TestCall {
    pub(crate) caller: Caller,
    pub(crate) events: broadcast::Receiver<RuntimeEvent>,
    pub(crate) handle: SessionHandle,
    session: JoinHandle<siphon::Result<CallSummary>>,
}

impl TestCall {
    /// Wait for the session to end and return its summary.
    pub(crate) async fn finish(&mut self) -> CallSummary {
        tokio::time::timeout(WAIT, &mut self.session)
            .await
            .expect("session should end")
            .unwrap()
            .unwrap()
    }

    /// Wait for the next runtime event matching `pred`.
    pub(crate) async fn wait_for<F>(&mut self, mut pred: F) -> RuntimeEvent
    where
        F: FnMut(&RuntimeEvent) -> bool,
    {
        let result = tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("runtime events closed"),
                }
            }
        })
        .await;
        result.expect("timed out waiting for runtime event")
    }

    /// Wait for the turn to move from `from` to `to`.
    pub(crate) async fn wait_for_turn(&mut self, from: TurnState, to: TurnState) {
        self.wait_for(|event| {
            matches!(
                event,
                RuntimeEvent::TurnChanged { transition, .. }
                    if transition.from == from && transition.to == to
            )
        })
        .await;
    }
}

/// Start `session` over a fresh in-process transport.
pub(crate) fn start_call(
    config: AgentConfig,
    stages: StageSet,
    pace_playout: bool,
    customize: impl FnOnce(SessionOrchestrator) -> SessionOrchestrator,
) -> TestCall {
    let sample_rate = config.vad.sample_rate;
    let (transport, caller) = ChannelTransport::pair(&config.transport);
    let transport = transport.with_playout_pacing(pace_playout);
    let (events_tx, events) = broadcast::channel(4_096);
    let session = SessionOrchestrator::new(config, CallId::new(), stages, Arc::new(transport))
        .with_runtime_events(events_tx);
    let session = customize(session);
    let handle = session.handle();
    TestCall {
        caller: Caller::new(caller, sample_rate),
        events,
        handle,
        session: tokio::spawn(session.run()),
    }
}

/// Turn states visited, in order.
pub(crate) fn path(summary: &CallSummary) -> Vec<TurnState> {
    summary.transitions.iter().map(|t| t.to).collect()
}
