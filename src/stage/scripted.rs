//! Deterministic STT, LLM and TTS adapters.
//!
//! These drive the call harness and the test suite. They behave like real
//! streaming providers (incremental output, provider-side pacing, honouring
//! cancellation) but their output is fully scripted.

use super::{DeltaStream, FrameStream, PipelineStage, StageStream};
use crate::config::VadConfig;
use crate::error::{StageError, StageKind};
use crate::pipeline::messages::{AudioFrame, Direction, LlmRequest, TextDelta, TranscriptSegment};
use crate::vad::VoiceActivityDetector;
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Queue of failures returned by successive `start` calls.
#[derive(Debug, Default)]
struct StartFailures(Mutex<VecDeque<StageError>>);

impl StartFailures {
    fn push(&self, err: StageError) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push_back(err);
    }

    fn next(&self) -> Option<StageError> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }
}

/// Scripted speech-to-text.
///
/// Watches the inbound audio with an energy detector. While the caller speaks
/// it emits a partial with the first word of the next scripted utterance; once
/// `finalize_after` of silence follows the speech it emits that utterance as a
/// final segment.
pub struct ScriptedStt {
    utterances: Arc<Mutex<VecDeque<String>>>,
    vad: VadConfig,
    finalize_after: Duration,
    failures: StartFailures,
}

impl ScriptedStt {
    /// Transcribe successive speech bursts as `utterances`, in order.
    pub fn new<I, S>(utterances: I, vad: VadConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            utterances: Arc::new(Mutex::new(utterances.into_iter().map(Into::into).collect())),
            vad,
            finalize_after: Duration::from_millis(60),
            failures: StartFailures::default(),
        }
    }

    /// Silence that must follow speech before the final is emitted.
    pub fn with_finalize_after(mut self, delay: Duration) -> Self {
        self.finalize_after = delay;
        self
    }

    /// Make the next `start` fail with `err`. May be called repeatedly.
    pub fn fail_next_start(self, err: StageError) -> Self {
        self.failures.push(err);
        self
    }
}

#[async_trait]
impl PipelineStage for ScriptedStt {
    type Input = FrameStream;
    type Output = TranscriptSegment;

    fn kind(&self) -> StageKind {
        StageKind::Stt
    }

    fn name(&self) -> &str {
        "scripted-stt"
    }

    async fn start(
        &self,
        input: FrameStream,
        cancel: CancellationToken,
    ) -> Result<StageStream<TranscriptSegment>, StageError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let utterances = Arc::clone(&self.utterances);
        let mut vad = VoiceActivityDetector::new(&self.vad);
        let finalize_after = self.finalize_after;

        Ok(Box::pin(stream! {
            let mut input = input;
            let mut speech_start: Option<Duration> = None;
            let mut speech_end = Duration::ZERO;
            let mut partial_sent = false;

            loop {
                let frame = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    frame = input.next() => frame,
                };
                let Some(frame) = frame else { break };
                let event = vad.process_frame(&frame);

                if event.is_speech() {
                    let start = *speech_start.get_or_insert(frame.captured_at);
                    speech_end = frame.captured_at + frame.duration();
                    if !partial_sent {
                        partial_sent = true;
                        let first_word = utterances
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .front()
                            .and_then(|u| u.split_whitespace().next().map(str::to_owned));
                        if let Some(word) = first_word {
                            yield Ok(TranscriptSegment::partial(word, start, speech_end));
                        }
                    }
                } else if let Some(start) = speech_start
                    && event.contiguous >= finalize_after
                {
                    speech_start = None;
                    partial_sent = false;
                    let text = utterances.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    if let Some(text) = text {
                        yield Ok(TranscriptSegment::final_text(text, start, speech_end));
                    }
                }
            }
        }))
    }
}

/// Scripted language model.
///
/// Replies with the scripted responses in order, one word per delta, then
/// echoes the caller once the script runs out.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    token_delay: Duration,
    failures: StartFailures,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    /// Reply with `responses`, in order.
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            token_delay: Duration::from_millis(5),
            failures: StartFailures::default(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Delay between streamed deltas.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Make the next `start` fail with `err`. May be called repeatedly.
    pub fn fail_next_start(self, err: StageError) -> Self {
        self.failures.push(err);
        self
    }

    /// Every request received so far, including failed starts.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PipelineStage for ScriptedLlm {
    type Input = LlmRequest;
    type Output = TextDelta;

    fn kind(&self) -> StageKind {
        StageKind::Llm
    }

    fn name(&self) -> &str {
        "scripted-llm"
    }

    async fn start(
        &self,
        request: LlmRequest,
        cancel: CancellationToken,
    ) -> Result<StageStream<TextDelta>, StageError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if let Some(err) = self.failures.next() {
            return Err(err);
        }

        let reply = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| format!("You said: {}", request.utterance.text));
        let words: Vec<String> = reply.split_whitespace().map(str::to_owned).collect();
        let token_delay = self.token_delay;

        Ok(Box::pin(stream! {
            for (i, word) in words.into_iter().enumerate() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(token_delay) => {}
                }
                let text = if i == 0 { word } else { format!(" {word}") };
                yield Ok(TextDelta::text(text));
            }
            yield Ok(TextDelta::end());
        }))
    }
}

/// Scripted text-to-speech.
///
/// Synthesizes a fixed number of loud PCM16 frames per input word.
pub struct ScriptedTts {
    sample_rate: u32,
    frame_ms: u32,
    frames_per_word: usize,
    amplitude: i16,
    frame_delay: Duration,
    failures: StartFailures,
}

impl ScriptedTts {
    /// 20 ms frames at `sample_rate`, five frames per word.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frame_ms: 20,
            frames_per_word: 5,
            amplitude: 6_000,
            frame_delay: Duration::from_millis(2),
            failures: StartFailures::default(),
        }
    }

    /// Frames synthesized per word.
    pub fn with_frames_per_word(mut self, frames: usize) -> Self {
        self.frames_per_word = frames;
        self
    }

    /// Synthesis time per frame.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Make the next `start` fail with `err`. May be called repeatedly.
    pub fn fail_next_start(self, err: StageError) -> Self {
        self.failures.push(err);
        self
    }
}

#[async_trait]
impl PipelineStage for ScriptedTts {
    type Input = DeltaStream;
    type Output = AudioFrame;

    fn kind(&self) -> StageKind {
        StageKind::Tts
    }

    fn name(&self) -> &str {
        "scripted-tts"
    }

    async fn start(
        &self,
        input: DeltaStream,
        cancel: CancellationToken,
    ) -> Result<StageStream<AudioFrame>, StageError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let sample_rate = self.sample_rate;
        let frame_len = (sample_rate as usize * self.frame_ms as usize) / 1_000;
        let frame_span = Duration::from_millis(u64::from(self.frame_ms));
        let frames_per_word = self.frames_per_word;
        let frame_delay = self.frame_delay;
        let samples: Vec<i16> = (0..frame_len)
            .map(|i| if i % 2 == 0 { self.amplitude } else { -self.amplitude })
            .collect();

        Ok(Box::pin(stream! {
            let mut input = input;
            let mut sequence = 0_u64;
            let mut offset = Duration::ZERO;

            'deltas: loop {
                let delta = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'deltas,
                    delta = input.next() => delta,
                };
                let Some(delta) = delta else { break };
                if delta.is_end {
                    break;
                }

                let frames = delta.text.split_whitespace().count() * frames_per_word;
                for _ in 0..frames {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break 'deltas,
                        () = tokio::time::sleep(frame_delay) => {}
                    }
                    yield Ok(AudioFrame::from_pcm16(
                        Direction::Outbound,
                        sequence,
                        offset,
                        sample_rate,
                        &samples,
                    ));
                    sequence += 1;
                    offset += frame_span;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::stage::StageRun;
    use futures_util::stream;

    fn frames(pattern: &[(i16, usize)]) -> FrameStream {
        let mut out = Vec::new();
        let mut seq = 0_u64;
        for &(amplitude, count) in pattern {
            for _ in 0..count {
                out.push(AudioFrame::from_pcm16(
                    Direction::Inbound,
                    seq,
                    Duration::from_millis(seq * 20),
                    16_000,
                    &[amplitude; 320],
                ));
                seq += 1;
            }
        }
        Box::pin(stream::iter(out))
    }

    fn request(text: &str) -> LlmRequest {
        LlmRequest {
            system_instructions: String::new(),
            history: Vec::new(),
            utterance: TranscriptSegment::final_text(text, Duration::ZERO, Duration::ZERO),
        }
    }

    #[tokio::test]
    async fn stt_finalizes_each_speech_burst() {
        let stt = ScriptedStt::new(["hello there", "bye"], VadConfig::default());
        let input = frames(&[(0, 2), (8_000, 10), (0, 5), (8_000, 5), (0, 5)]);
        let root = CancellationToken::new();
        let mut run = StageRun::start(&stt, input, &root).await.unwrap();

        let mut segments = Vec::new();
        while let Some(item) = run.next().await {
            segments.push(item.unwrap());
        }
        let finals: Vec<_> = segments.iter().filter(|s| s.is_final).collect();
        assert_eq!(finals.len(), 2);
        assert_eq!(finals[0].text, "hello there");
        assert_eq!(finals[0].start, Duration::from_millis(40));
        assert_eq!(finals[0].end, Duration::from_millis(240));
        assert_eq!(finals[1].text, "bye");
        assert_eq!(segments[0].text, "hello");
        assert!(!segments[0].is_final);
    }

    #[tokio::test]
    async fn llm_streams_words_then_end_marker() {
        let llm = ScriptedLlm::new(["We open at nine"]).with_token_delay(Duration::ZERO);
        let root = CancellationToken::new();
        let mut run = StageRun::start(&llm, request("hours?"), &root).await.unwrap();
        let mut text = String::new();
        let mut ended = false;
        while let Some(delta) = run.next().await {
            let delta = delta.unwrap();
            if delta.is_end {
                ended = true;
            }
            text.push_str(&delta.text);
        }
        assert!(ended);
        assert_eq!(text, "We open at nine");
        assert_eq!(llm.requests().len(), 1);
    }

    #[tokio::test]
    async fn llm_echoes_when_script_is_exhausted() {
        let llm = ScriptedLlm::new(Vec::<String>::new()).with_token_delay(Duration::ZERO);
        let root = CancellationToken::new();
        let mut run = StageRun::start(&llm, request("ping"), &root).await.unwrap();
        let mut text = String::new();
        while let Some(delta) = run.next().await {
            text.push_str(&delta.unwrap().text);
        }
        assert_eq!(text, "You said: ping");
    }

    #[tokio::test]
    async fn scripted_failures_are_returned_in_order() {
        let llm = ScriptedLlm::new(["ok"])
            .fail_next_start(StageError::transient(StageKind::Llm, "503"))
            .fail_next_start(StageError::fatal(StageKind::Llm, "401"));
        let root = CancellationToken::new();
        assert!(StageRun::start(&llm, request("a"), &root).await.err().unwrap().is_retryable());
        assert!(!StageRun::start(&llm, request("a"), &root).await.err().unwrap().is_retryable());
        assert!(StageRun::start(&llm, request("a"), &root).await.is_ok());
        assert_eq!(llm.requests().len(), 3);
    }

    #[tokio::test]
    async fn tts_emits_frames_per_word() {
        let tts = ScriptedTts::new(16_000)
            .with_frames_per_word(3)
            .with_frame_delay(Duration::ZERO);
        let deltas: DeltaStream = Box::pin(stream::iter(vec![
            TextDelta::text("two words"),
            TextDelta::text(" more"),
            TextDelta::end(),
            TextDelta::text("ignored after end"),
        ]));
        let root = CancellationToken::new();
        let mut run = StageRun::start(&tts, deltas, &root).await.unwrap();
        let mut produced = Vec::new();
        while let Some(frame) = run.next().await {
            produced.push(frame.unwrap());
        }
        assert_eq!(produced.len(), 9);
        assert!(produced.iter().all(|f| f.direction == Direction::Outbound));
        assert_eq!(produced[8].sequence, 8);
        assert_eq!(produced[0].duration(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn tts_stops_on_cancel() {
        let tts = ScriptedTts::new(16_000).with_frame_delay(Duration::from_millis(5));
        let deltas: DeltaStream = Box::pin(stream::iter(vec![TextDelta::text(
            "a long answer that keeps going and going",
        )]));
        let root = CancellationToken::new();
        let mut run = StageRun::start(&tts, deltas, &root).await.unwrap();
        assert!(run.next().await.is_some());
        run.cancel();
        assert!(run.next().await.is_none());
    }
}
