//! Call audio: the per-call frame bus and the media transport boundary.

pub mod bus;
pub mod transport;

pub use bus::{AudioFrameBus, BusStats, Outbound, SequenceVerdict};
pub use transport::{CallerEnd, ChannelTransport, LossMonitor, MediaTransport};
