//! Per-call audio frame bus.
//!
//! The inbound side is a sequencer: frames must arrive with non-decreasing
//! sequence numbers, duplicates and stale frames are rejected, gaps are
//! tolerated and counted as loss. The outbound side is a bounded ordered queue
//! that TTS fills and the transport writer drains; interruption truncates it.

use crate::pipeline::messages::{AudioFrame, Direction, GenerationId};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Result of offering an inbound frame to the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// The frame is next in order; `lost` frames were skipped before it.
    Accepted {
        /// Sequence numbers missing between the previous frame and this one.
        lost: u64,
    },
    /// Duplicate or out-of-order frame.
    Rejected,
}

/// Ordering guard for caller audio.
#[derive(Debug, Default)]
pub struct InboundSequencer {
    last: Option<u64>,
}

impl InboundSequencer {
    /// Check `sequence` against the last accepted frame.
    pub fn admit(&mut self, sequence: u64) -> SequenceVerdict {
        match self.last {
            Some(last) if sequence <= last => SequenceVerdict::Rejected,
            Some(last) => {
                self.last = Some(sequence);
                SequenceVerdict::Accepted {
                    lost: sequence - last - 1,
                }
            }
            None => {
                self.last = Some(sequence);
                SequenceVerdict::Accepted { lost: 0 }
            }
        }
    }
}

/// Item drained by the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A frame to send.
    Frame {
        /// Response the frame belongs to.
        generation: GenerationId,
        /// The frame, already stamped with its outbound sequence number.
        frame: AudioFrame,
    },
    /// Every frame of `generation` queued before this marker has been drained.
    EndOfGeneration(GenerationId),
}

/// Counters exposed for summaries and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Inbound frames accepted.
    pub inbound_accepted: u64,
    /// Inbound frames rejected as duplicate or stale.
    pub inbound_rejected: u64,
    /// Inbound sequence numbers never received.
    pub inbound_lost: u64,
    /// Outbound frames delivered to the transport.
    pub outbound_sent: u64,
    /// Outbound frames dropped by truncation.
    pub outbound_discarded: u64,
}

struct OutboundState {
    queue: VecDeque<Outbound>,
    next_sequence: u64,
    truncated_through: Option<GenerationId>,
    closed: bool,
}

impl OutboundState {
    fn frames_queued(&self) -> usize {
        self.queue
            .iter()
            .filter(|item| matches!(item, Outbound::Frame { .. }))
            .count()
    }

    fn is_truncated(&self, generation: GenerationId) -> bool {
        self.truncated_through.is_some_and(|t| generation <= t)
    }
}

/// Audio frame bus for one call.
pub struct AudioFrameBus {
    inbound: Mutex<InboundSequencer>,
    outbound: Mutex<OutboundState>,
    outbound_capacity: usize,
    stats: Mutex<BusStats>,
    /// Wakes the writer when something was queued or the bus closed.
    readable: Notify,
    /// Wakes producers when space was freed or the queue truncated.
    writable: Notify,
}

impl AudioFrameBus {
    /// Create a bus whose outbound queue holds at most `outbound_capacity` frames.
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            inbound: Mutex::new(InboundSequencer::default()),
            outbound: Mutex::new(OutboundState {
                queue: VecDeque::new(),
                next_sequence: 0,
                truncated_through: None,
                closed: false,
            }),
            outbound_capacity: outbound_capacity.max(1),
            stats: Mutex::new(BusStats::default()),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Offer a caller frame. Rejected frames must not reach VAD or STT.
    pub fn admit_inbound(&self, frame: &AudioFrame) -> SequenceVerdict {
        let verdict = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .admit(frame.sequence);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match verdict {
            SequenceVerdict::Accepted { lost } => {
                stats.inbound_accepted += 1;
                stats.inbound_lost += lost;
            }
            SequenceVerdict::Rejected => {
                stats.inbound_rejected += 1;
                debug!(sequence = frame.sequence, "inbound frame rejected");
            }
        }
        verdict
    }

    /// Queue an agent frame for `generation`, waiting for space.
    ///
    /// Returns `false` (and drops the frame) if the generation was truncated or
    /// the bus is closed.
    pub async fn push_frame(&self, generation: GenerationId, mut frame: AudioFrame) -> bool {
        loop {
            let notified = self.writable.notified();
            {
                let mut state = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
                if state.closed || state.is_truncated(generation) {
                    drop(state);
                    self.stats.lock().unwrap_or_else(|e| e.into_inner()).outbound_discarded += 1;
                    return false;
                }
                if state.frames_queued() < self.outbound_capacity {
                    frame.sequence = state.next_sequence;
                    frame.direction = Direction::Outbound;
                    state.next_sequence += 1;
                    state.queue.push_back(Outbound::Frame { generation, frame });
                    drop(state);
                    self.readable.notify_one();
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Queue the end-of-response marker for `generation`.
    pub fn push_end(&self, generation: GenerationId) {
        let mut state = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed || state.is_truncated(generation) {
            return;
        }
        state.queue.push_back(Outbound::EndOfGeneration(generation));
        drop(state);
        self.readable.notify_one();
    }

    /// Next outbound item, or `None` once the bus is closed and drained.
    pub async fn next_outbound(&self) -> Option<Outbound> {
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(item) = state.queue.pop_front() {
                    drop(state);
                    self.writable.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Drop everything queued for `generation` and anything it queues later.
    ///
    /// Returns the number of frames discarded now.
    pub fn truncate(&self, generation: GenerationId) -> usize {
        let mut state = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        state.truncated_through = Some(match state.truncated_through {
            Some(prev) if prev > generation => prev,
            _ => generation,
        });
        let before = state.frames_queued();
        state.queue.retain(|item| match item {
            Outbound::Frame { generation: g, .. } | Outbound::EndOfGeneration(g) => *g > generation,
        });
        let discarded = before - state.frames_queued();
        drop(state);

        self.stats.lock().unwrap_or_else(|e| e.into_inner()).outbound_discarded += discarded as u64;
        self.writable.notify_waiters();
        debug!(generation = %generation, discarded, "outbound queue truncated");
        discarded
    }

    /// Record a frame handed to the transport.
    pub fn record_sent(&self) {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).outbound_sent += 1;
    }

    /// Stop accepting frames and wake everyone. Queued items still drain.
    pub fn close(&self) {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Frames currently waiting to be sent.
    pub fn outbound_len(&self) -> usize {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .frames_queued()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BusStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::from_pcm16(Direction::Inbound, seq, Duration::ZERO, 16_000, &[1; 160])
    }

    #[test]
    fn sequencer_rejects_duplicates_and_counts_gaps() {
        let bus = AudioFrameBus::new(8);
        assert_eq!(bus.admit_inbound(&frame(0)), SequenceVerdict::Accepted { lost: 0 });
        assert_eq!(bus.admit_inbound(&frame(1)), SequenceVerdict::Accepted { lost: 0 });
        assert_eq!(bus.admit_inbound(&frame(1)), SequenceVerdict::Rejected);
        assert_eq!(bus.admit_inbound(&frame(4)), SequenceVerdict::Accepted { lost: 2 });
        assert_eq!(bus.admit_inbound(&frame(3)), SequenceVerdict::Rejected);

        let stats = bus.stats();
        assert_eq!(stats.inbound_accepted, 3);
        assert_eq!(stats.inbound_rejected, 2);
        assert_eq!(stats.inbound_lost, 2);
    }

    #[tokio::test]
    async fn outbound_sequences_increase_across_generations() {
        let bus = AudioFrameBus::new(8);
        assert!(bus.push_frame(GenerationId(0), frame(7)).await);
        bus.push_end(GenerationId(0));
        assert!(bus.push_frame(GenerationId(1), frame(0)).await);

        let mut sequences = Vec::new();
        let mut markers = Vec::new();
        bus.close();
        while let Some(item) = bus.next_outbound().await {
            match item {
                Outbound::Frame { frame, .. } => {
                    assert_eq!(frame.direction, Direction::Outbound);
                    sequences.push(frame.sequence);
                }
                Outbound::EndOfGeneration(id) => markers.push(id),
            }
        }
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(markers, vec![GenerationId(0)]);
    }

    #[tokio::test]
    async fn truncate_discards_queued_and_late_frames() {
        let bus = AudioFrameBus::new(16);
        for seq in 0..5 {
            bus.push_frame(GenerationId(2), frame(seq)).await;
        }
        assert_eq!(bus.truncate(GenerationId(2)), 5);
        assert_eq!(bus.outbound_len(), 0);

        // A frame that raced with cancellation is dropped too.
        assert!(!bus.push_frame(GenerationId(2), frame(5)).await);
        bus.push_end(GenerationId(2));
        assert_eq!(bus.stats().outbound_discarded, 6);

        // The next generation is unaffected, with a gap in the sequence.
        assert!(bus.push_frame(GenerationId(3), frame(0)).await);
        match bus.next_outbound().await {
            Some(Outbound::Frame { generation, frame }) => {
                assert_eq!(generation, GenerationId(3));
                assert_eq!(frame.sequence, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_until_drained() {
        let bus = Arc::new(AudioFrameBus::new(2));
        bus.push_frame(GenerationId(0), frame(0)).await;
        bus.push_frame(GenerationId(0), frame(1)).await;

        let producer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.push_frame(GenerationId(0), frame(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        bus.next_outbound().await;
        assert!(producer.await.unwrap());
        assert_eq!(bus.outbound_len(), 2);
    }

    #[tokio::test]
    async fn truncate_releases_blocked_producer() {
        let bus = Arc::new(AudioFrameBus::new(1));
        bus.push_frame(GenerationId(0), frame(0)).await;
        let producer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.push_frame(GenerationId(0), frame(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.truncate(GenerationId(0));
        assert!(!producer.await.unwrap());
    }
}
