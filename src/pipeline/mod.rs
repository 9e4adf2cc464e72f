//! Per-call conversation pipeline: turn-taking, response cycles and session wiring.

pub mod generation;
pub mod messages;
pub mod session;
pub mod transcript;
pub mod turn;

pub use session::{SessionEvent, SessionHandle, SessionOrchestrator};
pub use turn::{TurnAction, TurnController, TurnInput, TurnState};
