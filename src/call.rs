//! Call identity and lifecycle record.

use crate::fleet::NodeId;
use crate::pipeline::turn::{TurnState, Transition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one telephone leg.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    /// The caller hung up after the call was answered.
    HungUp,
    /// The caller hung up before the call was answered.
    Unanswered,
    /// The call was transferred to another destination.
    Transferred { destination: String },
    /// Media degraded beyond the loss threshold or the send path closed.
    TransportLost { detail: String },
    /// A provider failed fatally (or exhausted every fallback).
    ProviderFailure { detail: String },
    /// The hosting process asked the call to stop.
    Shutdown,
}

impl EndReason {
    /// Fatal endings are reported to the telephony layer as a hang-up request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TransportLost { .. } | Self::ProviderFailure { .. } | Self::Shutdown
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HungUp => f.write_str("caller hung up"),
            Self::Unanswered => f.write_str("unanswered"),
            Self::Transferred { destination } => write!(f, "transferred to {destination}"),
            Self::TransportLost { detail } => write!(f, "transport lost: {detail}"),
            Self::ProviderFailure { detail } => write!(f, "provider failure: {detail}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// One telephone leg handled by this runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Call identifier.
    pub id: CallId,
    /// Worker the call was dispatched to. Lookup only; the registry owns nodes.
    pub worker: Option<NodeId>,
    /// Caller phone number as reported by telephony.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    /// When the call record was created.
    pub created_at: DateTime<Utc>,
    /// When the call was answered, if it was.
    pub answered_at: Option<DateTime<Utc>>,
    /// When the call ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Current floor holder.
    pub turn_state: TurnState,
    /// Set once the call has ended.
    pub end_reason: Option<EndReason>,
}

impl Call {
    /// Create a call record in the `Idle` state.
    pub fn new(id: CallId, worker: Option<NodeId>) -> Self {
        Self {
            id,
            worker,
            caller: None,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            turn_state: TurnState::Idle,
            end_reason: None,
        }
    }

    /// Whether the call has reached its terminal state.
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Record the terminal time and reason. Only the first call has an effect.
    pub fn end(&mut self, reason: EndReason) {
        if self.is_ended() {
            return;
        }
        self.ended_at = Some(Utc::now());
        self.turn_state = TurnState::Idle;
        self.end_reason = Some(reason);
    }
}

/// Final report produced when a session finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    /// The finished call record.
    pub call: Call,
    /// Every TurnState transition, in order.
    pub transitions: Vec<Transition>,
    /// Finalized caller utterances.
    pub transcript: Vec<String>,
    /// Number of generation tasks started.
    pub generations: u64,
    /// Number of barge-ins that cancelled a generation.
    pub interruptions: u32,
    /// Outbound frames delivered to the transport.
    pub frames_sent: u64,
    /// Outbound frames discarded by interruption truncation.
    pub frames_discarded: u64,
}
