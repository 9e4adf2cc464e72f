//! Worker-side hosting: registration, heartbeats and the sessions a node runs.

use super::NodeId;
use super::registry::WorkerRegistry;
use crate::call::{CallId, CallSummary};
use crate::error::{DispatchError, Result};
use crate::persistence::PersistenceForwarder;
use crate::pipeline::{SessionHandle, SessionOrchestrator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A worker process hosting call sessions.
///
/// Cloning is cheap; clones share the same sessions and lifecycle.
#[derive(Clone)]
pub struct WorkerHost {
    id: NodeId,
    address: String,
    agent: String,
    registry: Arc<WorkerRegistry>,
    persistence: Option<Arc<PersistenceForwarder>>,
    sessions: Arc<Mutex<HashMap<CallId, SessionHandle>>>,
    tracker: TaskTracker,
    draining: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WorkerHost {
    /// Create a host for `id`, reachable at `address`, serving calls to `agent`.
    pub fn new(
        id: NodeId,
        address: impl Into<String>,
        agent: impl Into<String>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            agent: agent.into(),
            registry,
            persistence: None,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            draining: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Persist every hosted call through `forwarder`, closing it at shutdown.
    pub fn with_persistence(mut self, forwarder: Arc<PersistenceForwarder>) -> Self {
        self.persistence = Some(forwarder);
        self
    }

    /// This node's identifier.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Register with the fleet and start heartbeating.
    pub fn start(&self) -> JoinHandle<()> {
        self.registry
            .register(self.id.clone(), self.address.clone(), self.agent.clone());
        let host = self.clone();
        tokio::spawn(async move { host.run_heartbeat_loop().await })
    }

    async fn run_heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.registry.config().heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reported = u32::try_from(self.active_sessions()).unwrap_or(u32::MAX);
                    match self.registry.heartbeat(&self.id, reported) {
                        Ok(()) => {}
                        Err(DispatchError::UnknownWorker(_)) if self.draining.load(Ordering::Acquire) => {
                            info!(node = %self.id, "drained worker left the fleet");
                            break;
                        }
                        Err(DispatchError::UnknownWorker(_)) => {
                            warn!(node = %self.id, "heartbeat rejected; registering again");
                            self.registry
                                .register(self.id.clone(), self.address.clone(), self.agent.clone());
                        }
                        Err(e) => warn!(node = %self.id, "heartbeat failed: {e}"),
                    }
                }
            }
        }
        debug!(node = %self.id, "heartbeat loop stopped");
    }

    /// Run `session` on this node.
    ///
    /// The call is released in the registry exactly once when the session ends,
    /// however it ends.
    pub fn host(&self, session: SessionOrchestrator) -> JoinHandle<Result<CallSummary>> {
        let mut session = session
            .with_worker(self.id.clone())
            .with_cancel_token(self.cancel.child_token());
        if let Some(forwarder) = &self.persistence {
            session = session.with_persistence(Arc::clone(forwarder));
        }
        let call_id = session.call_id().clone();
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(call_id.clone(), session.handle());
        info!(node = %self.id, call_id = %call_id, "hosting call");

        let host = self.clone();
        self.tracker.spawn(async move {
            let outcome = session.run().await;
            host.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&call_id);
            if host.registry.release(&call_id).is_none() {
                debug!(node = %host.id, call_id = %call_id, "call was not placed in the registry");
            }
            outcome
        })
    }

    /// Control handle for a hosted call.
    pub fn session(&self, call: &CallId) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(call)
            .cloned()
    }

    /// Number of calls currently running here.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Take no new calls; leave the fleet once the running ones end.
    pub fn drain(&self) -> std::result::Result<(), DispatchError> {
        self.draining.store(true, Ordering::Release);
        self.registry.drain(&self.id)
    }

    /// End every hosted call, wait for them, flush persistence and leave the fleet.
    pub async fn shutdown(&self) {
        info!(node = %self.id, sessions = self.active_sessions(), "worker shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if let Some(forwarder) = &self.persistence {
            forwarder.close().await;
        }
        self.registry.deregister(&self.id);
    }
}
