//! Media transport boundary.
//!
//! The physical stack (WebRTC, SIP media) lives outside this crate. A session
//! only needs a best-effort, bidirectional frame channel, expressed by
//! [`MediaTransport`]. [`ChannelTransport`] is the in-process implementation
//! used by the harness and tests.

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::pipeline::messages::AudioFrame;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::{Mutex, mpsc};

/// Best-effort bidirectional audio channel for one call.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Next caller frame, or `None` once the media stream has ended.
    async fn receive(&self) -> Option<AudioFrame>;

    /// Deliver one agent frame to the caller.
    async fn send(&self, frame: AudioFrame) -> Result<(), TransportError>;
}

/// In-process transport backed by tokio channels.
pub struct ChannelTransport {
    inbound: Mutex<mpsc::Receiver<AudioFrame>>,
    outbound: mpsc::Sender<AudioFrame>,
    pace_playout: bool,
}

/// The caller's side of a [`ChannelTransport`].
pub struct CallerEnd {
    /// Audio spoken by the caller.
    pub speak: mpsc::Sender<AudioFrame>,
    /// Audio heard by the caller.
    pub hear: mpsc::Receiver<AudioFrame>,
}

impl ChannelTransport {
    /// Create a connected transport / caller pair.
    pub fn pair(config: &TransportConfig) -> (Self, CallerEnd) {
        let (speak, inbound) = mpsc::channel(config.inbound_queue_frames.max(1));
        let (outbound, hear) = mpsc::channel(config.outbound_queue_frames.max(1));
        (
            Self {
                inbound: Mutex::new(inbound),
                outbound,
                pace_playout: false,
            },
            CallerEnd { speak, hear },
        )
    }

    /// Make `send` take as long as the frame plays, like a real-time sink.
    pub fn with_playout_pacing(mut self, pace: bool) -> Self {
        self.pace_playout = pace;
        self
    }
}

#[async_trait]
impl MediaTransport for ChannelTransport {
    async fn receive(&self) -> Option<AudioFrame> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, frame: AudioFrame) -> Result<(), TransportError> {
        let playout = frame.duration();
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)?;
        if self.pace_playout {
            tokio::time::sleep(playout).await;
        }
        Ok(())
    }
}

/// Sliding-window frame loss tracker.
///
/// The call is considered dead once a full window of outcomes shows a loss
/// ratio above the configured maximum.
#[derive(Debug)]
pub struct LossMonitor {
    window: VecDeque<bool>,
    capacity: usize,
    max_loss_ratio: f32,
    lost_in_window: usize,
}

impl LossMonitor {
    /// Create a monitor from transport configuration.
    pub fn new(config: &TransportConfig) -> Self {
        let capacity = config.loss_window_frames.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            max_loss_ratio: config.max_loss_ratio,
            lost_in_window: 0,
        }
    }

    /// Record a frame that arrived or was delivered.
    pub fn record_delivered(&mut self) {
        self.push(false);
    }

    /// Record `count` frames that never arrived or failed to send.
    pub fn record_lost(&mut self, count: u64) {
        let count = usize::try_from(count).unwrap_or(usize::MAX).min(self.capacity);
        for _ in 0..count {
            self.push(true);
        }
    }

    /// Loss ratio over the current window.
    pub fn loss_ratio(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.lost_in_window as f32 / self.window.len() as f32
    }

    /// Whether the stream has degraded beyond recovery.
    pub fn is_dead(&self) -> bool {
        self.window.len() == self.capacity && self.loss_ratio() > self.max_loss_ratio
    }

    fn push(&mut self, lost: bool) {
        if self.window.len() == self.capacity
            && let Some(evicted) = self.window.pop_front()
            && evicted
        {
            self.lost_in_window -= 1;
        }
        self.window.push_back(lost);
        if lost {
            self.lost_in_window += 1;
        }
    }
}
