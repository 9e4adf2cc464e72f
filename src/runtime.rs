//! Runtime events emitted by a call session for observability.
//!
//! This is intentionally lightweight (no audio payloads) so the session can
//! emit events without blocking the media path. Events go out on a
//! `tokio::sync::broadcast` channel; slow subscribers lag and miss events
//! rather than stall the call.

use crate::call::{CallId, EndReason};
use crate::pipeline::messages::{GenerationId, TranscriptSegment};
use crate::pipeline::turn::Transition;
use serde::Serialize;
use std::time::Duration;

/// Events that describe what a call is doing "right now".
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// The floor changed hands.
    TurnChanged {
        call_id: CallId,
        transition: Transition,
    },
    /// Caller speech recognised by STT (partial or final).
    Transcript {
        call_id: CallId,
        segment: TranscriptSegment,
    },
    /// Text the agent generated for a response.
    AgentText {
        call_id: CallId,
        generation: GenerationId,
        text: String,
    },
    /// A barge-in cancelled a response.
    Interruption {
        call_id: CallId,
        generation: GenerationId,
        /// Time from receiving the caller frame that completed the barge-in
        /// until the agent's queued audio was discarded. At most the one frame
        /// already being written to the transport plays after that.
        truncation_latency: Duration,
        /// Queued agent frames that were discarded.
        frames_discarded: usize,
    },
    /// The call ended.
    CallEnded { call_id: CallId, reason: EndReason },
}
