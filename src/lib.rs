//! Siphon: self-hosted runtime for real-time telephone voice agents.
//!
//! Each answered call runs a cascaded streaming pipeline:
//! Caller audio → VAD → STT → LLM → TTS → Caller audio
//!
//! # Architecture
//!
//! - **Audio**: a per-call frame bus with inbound sequencing and an outbound
//!   queue that can be truncated on barge-in ([`audio`])
//! - **VAD**: energy-based speech detection on inbound frames ([`vad`])
//! - **Stages**: STT, LLM and TTS behind one streaming, cancellable contract
//!   ([`stage`])
//! - **Turn-taking**: a pure state machine that decides who holds the floor
//!   ([`pipeline::turn`])
//! - **Sessions**: per-call orchestration wiring the above together
//!   ([`pipeline::session`])
//! - **Fleet**: worker registry, heartbeats and least-loaded call dispatch
//!   ([`fleet`])
//! - **Memory**: per-caller notes carried into the next call's instructions
//!   ([`memory`])

pub mod audio;
pub mod call;
pub mod config;
pub mod error;
pub mod fleet;
pub mod memory;
pub mod persistence;
pub mod pipeline;
pub mod runtime;
pub mod stage;
pub mod telephony;
pub mod vad;

pub use call::{Call, CallId, CallSummary, EndReason};
pub use config::AgentConfig;
pub use error::{Result, SiphonError, StageError, StageKind};
pub use fleet::{Dispatcher, NodeId, WorkerHost, WorkerRegistry};
pub use memory::{CallerMemory, CallerProfile};
pub use pipeline::{SessionHandle, SessionOrchestrator, TurnController, TurnState};
pub use runtime::RuntimeEvent;
pub use stage::{PipelineStage, StageSet};
