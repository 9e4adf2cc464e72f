//! Call persistence: recordings, transcripts and metadata.
//!
//! Storage backends sit behind [`PersistenceSink`]. Sessions never talk to a
//! sink directly; they go through a [`PersistenceForwarder`], which applies the
//! per-stream config flags and hands events to a bounded queue drained by a
//! background task. When the sink falls behind, events are dropped and counted
//! so the media path never waits on storage.
//!
//! One forwarder is usually shared by every call on a worker. Sessions only
//! offer events; whoever created the forwarder closes it at shutdown.

use crate::call::{CallId, EndReason};
use crate::config::PersistenceConfig;
use crate::error::{Result, SiphonError};
use crate::fleet::NodeId;
use crate::pipeline::messages::{AudioFrame, Direction, TranscriptSegment};
use crate::pipeline::turn::Transition;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Call-level metadata entries.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum MetadataRecord {
    /// The call was created.
    CallStarted {
        at: DateTime<Utc>,
        worker: Option<NodeId>,
    },
    /// The floor changed hands.
    Transition(Transition),
    /// The call ended.
    CallEnded {
        at: DateTime<Utc>,
        reason: EndReason,
        answered: bool,
    },
}

/// One unit of persisted call data.
#[derive(Debug, Clone)]
pub enum PersistenceEvent {
    /// Raw audio for the recording.
    Audio {
        call_id: CallId,
        direction: Direction,
        payload: Bytes,
    },
    /// A finalized caller utterance.
    Transcript {
        call_id: CallId,
        segment: TranscriptSegment,
    },
    /// A metadata entry.
    Metadata {
        call_id: CallId,
        record: MetadataRecord,
    },
}

impl PersistenceEvent {
    /// Call the event belongs to.
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Audio { call_id, .. }
            | Self::Transcript { call_id, .. }
            | Self::Metadata { call_id, .. } => call_id,
        }
    }
}

/// Storage backend for call data.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Store one event.
    async fn write(&self, event: PersistenceEvent) -> Result<()>;

    /// Make everything written so far durable.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Fire-and-forget front end to a [`PersistenceSink`].
pub struct PersistenceForwarder {
    config: PersistenceConfig,
    tx: Mutex<Option<mpsc::Sender<PersistenceEvent>>>,
    dropped: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceForwarder {
    /// A forwarder that persists nothing.
    pub fn disabled() -> Self {
        Self {
            config: PersistenceConfig::default(),
            tx: Mutex::new(None),
            dropped: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the drain task for `sink`.
    ///
    /// If every stream is disabled in `config`, no task is spawned.
    pub fn spawn(sink: Arc<dyn PersistenceSink>, config: &PersistenceConfig) -> Self {
        if !config.any_enabled() {
            return Self::disabled();
        }
        let (tx, mut rx) = mpsc::channel::<PersistenceEvent>(config.queue_depth.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let call_id = event.call_id().clone();
                if let Err(e) = sink.write(event).await {
                    warn!(call_id = %call_id, "persistence write failed: {e}");
                }
            }
            if let Err(e) = sink.flush().await {
                warn!("persistence flush failed: {e}");
            }
        });
        Self {
            config: config.clone(),
            tx: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Record a frame if audio recording is enabled.
    pub fn audio(&self, call_id: &CallId, frame: &AudioFrame) {
        if self.config.record_audio {
            self.offer(PersistenceEvent::Audio {
                call_id: call_id.clone(),
                direction: frame.direction,
                payload: frame.payload.clone(),
            });
        }
    }

    /// Record a final transcript segment if transcription is enabled.
    pub fn transcript(&self, call_id: &CallId, segment: &TranscriptSegment) {
        if self.config.save_transcription && segment.is_final {
            self.offer(PersistenceEvent::Transcript {
                call_id: call_id.clone(),
                segment: segment.clone(),
            });
        }
    }

    /// Record a metadata entry if metadata is enabled.
    pub fn metadata(&self, call_id: &CallId, record: MetadataRecord) {
        if self.config.save_metadata {
            self.offer(PersistenceEvent::Metadata {
                call_id: call_id.clone(),
                record,
            });
        }
    }

    /// Events dropped because the sink could not keep up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events and wait for the queue to drain.
    ///
    /// Events offered afterwards are counted as dropped.
    pub async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!("persistence task failed: {e}");
        }
        let dropped = self.dropped();
        if dropped > 0 {
            warn!(dropped, "persistence events were dropped");
        }
    }

    fn offer(&self, event: PersistenceEvent) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            // Only an enabled forwarder can have been closed.
            if self.config.any_enabled() {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(call_id = %event.call_id(), dropped, "persistence closed; event dropped");
            }
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(call_id = %event.call_id(), dropped, "persistence queue full; event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(call_id = %event.call_id(), dropped, "persistence task gone; event dropped");
            }
        }
    }
}

/// Writes each call under `<root>/<call_id>/`.
///
/// Transcripts and metadata are JSON lines; audio is appended as raw payload
/// bytes, one file per direction.
pub struct JsonlSink {
    root: PathBuf,
}

impl JsonlSink {
    /// Create a sink rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one call's files.
    pub fn call_dir(&self, call_id: &CallId) -> PathBuf {
        self.root.join(call_id.as_str())
    }

    async fn append(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(bytes).await?;
        Ok(())
    }

    fn json_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(value)
            .map_err(|e| SiphonError::Persistence(format!("failed to encode record: {e}")))?;
        line.push(b'\n');
        Ok(line)
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    async fn write(&self, event: PersistenceEvent) -> Result<()> {
        let dir = self.call_dir(event.call_id());
        match event {
            PersistenceEvent::Audio {
                direction, payload, ..
            } => {
                let name = match direction {
                    Direction::Inbound => "inbound.pcm",
                    Direction::Outbound => "outbound.pcm",
                };
                Self::append(&dir.join(name), &payload).await
            }
            PersistenceEvent::Transcript { segment, .. } => {
                Self::append(&dir.join("transcript.jsonl"), &Self::json_line(&segment)?).await
            }
            PersistenceEvent::Metadata { record, .. } => {
                Self::append(&dir.join("metadata.jsonl"), &Self::json_line(&record)?).await
            }
        }
    }
}
