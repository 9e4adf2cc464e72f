//! Signaling boundary with the telephony layer.
//!
//! SIP trunking and number provisioning live outside this crate. A session
//! consumes per-call [`SignalingEvent`]s and reports back with
//! [`TelephonyCommand`]s.

use crate::call::{CallId, EndReason};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Call-state change reported by the telephony layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalingEvent {
    /// The remote party's phone is ringing.
    Ringing,
    /// The call was picked up; media flows from now on.
    Answered,
    /// The caller hung up.
    HungUp,
    /// The call was handed off elsewhere.
    Transferred { destination: String },
}

/// Request from a session to the telephony layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelephonyCommand {
    /// Tear down the telephone leg after a fatal failure.
    HangUp { call_id: CallId, reason: EndReason },
}

/// The session's side of the signaling channel.
pub struct TelephonyLink {
    /// Signaling events for this call.
    pub events: mpsc::Receiver<SignalingEvent>,
    /// Commands back to the telephony layer.
    pub commands: mpsc::Sender<TelephonyCommand>,
}

/// The telephony layer's side of the signaling channel.
pub struct SignalingEnd {
    /// Push signaling events to the session.
    pub events: mpsc::Sender<SignalingEvent>,
    /// Commands issued by the session.
    pub commands: mpsc::Receiver<TelephonyCommand>,
}

/// Create a connected signaling pair for one call.
pub fn signaling_pair(depth: usize) -> (TelephonyLink, SignalingEnd) {
    let (event_tx, event_rx) = mpsc::channel(depth.max(1));
    let (command_tx, command_rx) = mpsc::channel(depth.max(1));
    (
        TelephonyLink {
            events: event_rx,
            commands: command_tx,
        },
        SignalingEnd {
            events: event_tx,
            commands: command_rx,
        },
    )
}
