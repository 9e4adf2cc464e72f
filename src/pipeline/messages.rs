//! Message types passed between pipeline stages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Direction of an audio frame relative to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Caller → agent.
    Inbound,
    /// Agent → caller.
    Outbound,
}

/// A fixed-size chunk of call audio.
///
/// The payload is opaque to the bus; the VAD reads it as mono little-endian PCM16.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Monotonically increasing per direction.
    pub sequence: u64,
    /// Which leg the frame belongs to.
    pub direction: Direction,
    /// Media timestamp relative to the start of the call.
    pub captured_at: Duration,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Raw payload.
    pub payload: Bytes,
}

impl AudioFrame {
    /// Build a frame from PCM16 samples.
    pub fn from_pcm16(
        direction: Direction,
        sequence: u64,
        captured_at: Duration,
        sample_rate: u32,
        samples: &[i16],
    ) -> Self {
        let mut payload = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        Self {
            sequence,
            direction,
            captured_at,
            sample_rate,
            payload: Bytes::from(payload),
        }
    }

    /// Number of PCM16 samples in the payload.
    pub fn sample_count(&self) -> usize {
        self.payload.len() / 2
    }

    /// Playback duration of the frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let micros = self.sample_count() as u64 * 1_000_000 / u64::from(self.sample_rate);
        Duration::from_micros(micros)
    }

    /// Samples normalised to \[-1, 1\].
    pub fn samples(&self) -> impl Iterator<Item = f32> + '_ {
        self.payload
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0)
    }
}

/// A transcription result from the STT stage.
///
/// Partial segments may be revised by later partials until one is marked final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Transcribed text.
    pub text: String,
    /// Whether this segment is final (immutable from now on).
    pub is_final: bool,
    /// Media time where the segment starts.
    pub start: Duration,
    /// Media time where the segment ends.
    pub end: Duration,
}

impl TranscriptSegment {
    /// A final segment.
    pub fn final_text(text: impl Into<String>, start: Duration, end: Duration) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            start,
            end,
        }
    }

    /// A partial, revisable segment.
    pub fn partial(text: impl Into<String>, start: Duration, end: Duration) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            start,
            end,
        }
    }

    /// Merge consecutive final segments into one utterance.
    pub fn merge(segments: &[TranscriptSegment]) -> Option<Self> {
        let first = segments.first()?;
        let last = segments.last()?;
        let mut text = String::new();
        for segment in segments {
            let piece = segment.text.trim();
            if piece.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(piece);
        }
        Some(Self::final_text(text, first.start, last.end))
    }
}

/// A text fragment streamed by the LLM stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    /// Decoded text fragment.
    pub text: String,
    /// End-of-response marker; `text` is usually empty when set.
    pub is_end: bool,
}

impl TextDelta {
    /// A content fragment.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_end: false,
        }
    }

    /// The end-of-response marker.
    pub fn end() -> Self {
        Self {
            text: String::new(),
            is_end: true,
        }
    }
}

/// Who said something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The telephone caller.
    Caller,
    /// The AI agent.
    Agent,
}

/// One entry of conversation history sent to the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Speaker of the turn.
    pub speaker: Speaker,
    /// What was said (for the agent: what was generated before any interruption).
    pub text: String,
    /// Set when the agent was cut off by the caller.
    pub interrupted: bool,
}

/// Input to the LLM stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    /// Operator-supplied system instructions.
    pub system_instructions: String,
    /// Bounded conversation history, oldest first.
    pub history: Vec<ConversationTurn>,
    /// The finalized caller utterance to respond to.
    pub utterance: TranscriptSegment,
}

/// Identifier of one LLM+TTS response cycle within a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}
