//! Fleet-wide registry of live worker nodes and call placements.
//!
//! The registry is the single source of truth for which node owns a call. All
//! state sits behind one `RwLock`: placement decisions and lookups read,
//! registration, heartbeats, placement and eviction write. Registry operations
//! are cheap compared with call lifetimes, so a single lock is enough.
//!
//! Liveness is judged against explicit epoch-millisecond timestamps (`*_at`
//! methods) so it can be tested without sleeping.

use super::{NodeId, now_epoch_millis};
use crate::call::CallId;
use crate::config::FleetConfig;
use crate::error::DispatchError;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerNode {
    /// Node identifier.
    pub id: NodeId,
    /// Address signaling should be routed to.
    pub address: String,
    /// Agent this node serves; only calls for that agent are placed here.
    pub agent: String,
    /// Calls currently placed on this node.
    pub session_count: u32,
    /// Session count the node itself last reported.
    pub reported_sessions: u32,
    /// Epoch milliseconds of the last registration or heartbeat.
    pub last_heartbeat_ms: u64,
    /// Draining nodes get no new calls and leave once empty.
    pub draining: bool,
}

/// Topology change broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A node registered for the first time (or after eviction).
    NodeJoined { node: NodeId },
    /// A node missed too many heartbeats.
    NodeEvicted { node: NodeId, orphaned: Vec<CallId> },
    /// A node deregistered or finished draining.
    NodeLeft { node: NodeId, orphaned: Vec<CallId> },
}

/// Result of evicting one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// The evicted node.
    pub node: NodeId,
    /// Calls it owned, now orphaned.
    pub orphaned: Vec<CallId>,
}

#[derive(Debug, Clone)]
struct Placement {
    node: NodeId,
    orphaned: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    nodes: BTreeMap<NodeId, WorkerNode>,
    placements: HashMap<CallId, Placement>,
}

impl RegistryState {
    /// Mark every call on `node` orphaned and return them, sorted.
    fn orphan_calls_of(&mut self, node: &NodeId) -> Vec<CallId> {
        let mut orphaned: Vec<CallId> = self
            .placements
            .iter_mut()
            .filter(|(_, p)| &p.node == node && !p.orphaned)
            .map(|(call, p)| {
                p.orphaned = true;
                call.clone()
            })
            .collect();
        orphaned.sort();
        orphaned
    }
}

/// Shared registry of worker nodes.
pub struct WorkerRegistry {
    config: FleetConfig,
    state: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new(config: FleetConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
            events,
        }
    }

    /// Fleet timing this registry was built with.
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Observe topology changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register `node` as serving `agent`, or refresh it if already present.
    ///
    /// Returns `true` if the node was not registered before. Repeated
    /// registration keeps a single entry with the latest heartbeat, address
    /// and agent.
    pub fn register_at(
        &self,
        node: NodeId,
        address: impl Into<String>,
        agent: impl Into<String>,
        now_ms: u64,
    ) -> bool {
        let address = address.into();
        let agent = agent.into();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = state.nodes.get_mut(&node) {
            existing.address = address;
            existing.agent = agent;
            existing.last_heartbeat_ms = existing.last_heartbeat_ms.max(now_ms);
            debug!(node = %node, "worker re-registered");
            return false;
        }
        info!(node = %node, agent = %agent, "worker registered");
        state.nodes.insert(
            node.clone(),
            WorkerNode {
                id: node.clone(),
                address,
                agent,
                session_count: 0,
                reported_sessions: 0,
                last_heartbeat_ms: now_ms,
                draining: false,
            },
        );
        drop(state);
        self.emit(RegistryEvent::NodeJoined { node });
        true
    }

    /// Register at the current wall-clock time.
    pub fn register(&self, node: NodeId, address: impl Into<String>, agent: impl Into<String>) -> bool {
        self.register_at(node, address, agent, now_epoch_millis())
    }

    /// Record a heartbeat from `node`.
    ///
    /// An evicted node is unknown and must register again.
    pub fn heartbeat_at(
        &self,
        node: &NodeId,
        reported_sessions: u32,
        now_ms: u64,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| DispatchError::UnknownWorker(node.to_string()))?;
        entry.last_heartbeat_ms = entry.last_heartbeat_ms.max(now_ms);
        entry.reported_sessions = reported_sessions;
        Ok(())
    }

    /// Heartbeat at the current wall-clock time.
    pub fn heartbeat(&self, node: &NodeId, reported_sessions: u32) -> Result<(), DispatchError> {
        self.heartbeat_at(node, reported_sessions, now_epoch_millis())
    }

    /// Whether a node last heard from at `last_heartbeat_ms` is still live.
    fn is_live(&self, last_heartbeat_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(last_heartbeat_ms) < self.config.liveness_timeout_ms()
    }

    /// Place a call for `agent` on the node chosen by `select`, atomically.
    ///
    /// `select` sees the live, non-draining nodes serving `agent` in identifier
    /// order, and the chosen node's session count is incremented under the
    /// same write lock.
    pub fn place_at<F>(
        &self,
        call: &CallId,
        agent: &str,
        now_ms: u64,
        select: F,
    ) -> Result<NodeId, DispatchError>
    where
        F: FnOnce(&[&WorkerNode]) -> Option<NodeId>,
    {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = state.placements.get(call)
            && !existing.orphaned
        {
            return Err(DispatchError::AlreadyPlaced(call.to_string()));
        }

        let candidates: Vec<&WorkerNode> = state
            .nodes
            .values()
            .filter(|n| n.agent == agent && !n.draining && self.is_live(n.last_heartbeat_ms, now_ms))
            .collect();
        let chosen = select(&candidates).ok_or(DispatchError::NoLiveWorkers)?;

        let node = state
            .nodes
            .get_mut(&chosen)
            .ok_or_else(|| DispatchError::UnknownWorker(chosen.to_string()))?;
        node.session_count = node.session_count.saturating_add(1);
        state.placements.insert(
            call.clone(),
            Placement {
                node: chosen.clone(),
                orphaned: false,
            },
        );
        Ok(chosen)
    }

    /// Release `call` from its node. Only the first release has an effect.
    ///
    /// Returns the node the call was placed on. A draining node leaves the
    /// registry when its last call is released.
    pub fn release(&self, call: &CallId) -> Option<NodeId> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let placement = state.placements.remove(call)?;
        if placement.orphaned {
            debug!(call_id = %call, node = %placement.node, "orphaned call released");
            return Some(placement.node);
        }

        let mut drained = false;
        if let Some(node) = state.nodes.get_mut(&placement.node) {
            node.session_count = node.session_count.saturating_sub(1);
            drained = node.draining && node.session_count == 0;
        }
        if drained {
            state.nodes.remove(&placement.node);
        }
        drop(state);

        if drained {
            info!(node = %placement.node, "drained worker left");
            self.emit(RegistryEvent::NodeLeft {
                node: placement.node.clone(),
                orphaned: Vec::new(),
            });
        }
        Some(placement.node)
    }

    /// Stop placing calls on `node`; it leaves once its calls are released.
    pub fn drain(&self, node: &NodeId) -> Result<(), DispatchError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| DispatchError::UnknownWorker(node.to_string()))?;
        entry.draining = true;
        let empty = entry.session_count == 0;
        if empty {
            state.nodes.remove(node);
        }
        drop(state);

        info!(node = %node, left = empty, "worker draining");
        if empty {
            self.emit(RegistryEvent::NodeLeft {
                node: node.clone(),
                orphaned: Vec::new(),
            });
        }
        Ok(())
    }

    /// Remove `node` immediately. Calls it owned are orphaned.
    ///
    /// Returns `None` if the node was not registered.
    pub fn deregister(&self, node: &NodeId) -> Option<Vec<CallId>> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.nodes.remove(node)?;
        let orphaned = state.orphan_calls_of(node);
        drop(state);

        info!(node = %node, orphaned = orphaned.len(), "worker deregistered");
        self.emit(RegistryEvent::NodeLeft {
            node: node.clone(),
            orphaned: orphaned.clone(),
        });
        Some(orphaned)
    }

    /// Evict every node whose last heartbeat is older than the liveness timeout.
    pub fn sweep_at(&self, now_ms: u64) -> Vec<Eviction> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<NodeId> = state
            .nodes
            .values()
            .filter(|n| !self.is_live(n.last_heartbeat_ms, now_ms))
            .map(|n| n.id.clone())
            .collect();

        let mut evictions = Vec::with_capacity(stale.len());
        for node in stale {
            state.nodes.remove(&node);
            let orphaned = state.orphan_calls_of(&node);
            evictions.push(Eviction { node, orphaned });
        }
        drop(state);

        for eviction in &evictions {
            warn!(
                node = %eviction.node,
                orphaned = eviction.orphaned.len(),
                "worker evicted after missed heartbeats"
            );
            self.emit(RegistryEvent::NodeEvicted {
                node: eviction.node.clone(),
                orphaned: eviction.orphaned.clone(),
            });
        }
        evictions
    }

    /// Sweep on every heartbeat interval until `cancel` fires.
    pub async fn run_eviction_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_at(now_epoch_millis());
                }
            }
        }
        debug!("eviction loop stopped");
    }

    /// Node currently owning `call`, unless the call is orphaned.
    pub fn owner_of(&self, call: &CallId) -> Option<NodeId> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .placements
            .get(call)
            .filter(|p| !p.orphaned)
            .map(|p| p.node.clone())
    }

    /// Calls whose node was evicted or departed, for external recovery.
    pub fn orphaned_calls(&self) -> Vec<CallId> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut calls: Vec<CallId> = state
            .placements
            .iter()
            .filter(|(_, p)| p.orphaned)
            .map(|(call, _)| call.clone())
            .collect();
        calls.sort();
        calls
    }

    /// Snapshot of one node.
    pub fn node(&self, node: &NodeId) -> Option<WorkerNode> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.nodes.get(node).cloned()
    }

    /// Snapshot of every registered node, in identifier order.
    pub fn nodes(&self) -> Vec<WorkerNode> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.nodes.values().cloned().collect()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
