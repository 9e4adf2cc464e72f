//! Least-loaded call placement.

use super::registry::{WorkerNode, WorkerRegistry};
use super::{NodeId, now_epoch_millis};
use crate::call::CallId;
use crate::error::DispatchError;
use std::sync::Arc;
use tracing::{info, warn};

/// Assigns incoming calls for one agent to worker nodes.
///
/// Each assignment picks the live, non-draining node serving the agent with
/// the fewest sessions, breaking ties by node identifier. Because every
/// decision reads the current registry, joins, evictions and drains are picked
/// up by the next call.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    agent: String,
}

impl Dispatcher {
    /// Create a dispatcher for calls to `agent` over a shared registry.
    pub fn new(registry: Arc<WorkerRegistry>, agent: impl Into<String>) -> Self {
        Self {
            registry,
            agent: agent.into(),
        }
    }

    /// Agent whose calls this dispatcher places.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// The registry this dispatcher places calls in.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Place `call` at the given epoch-millisecond time.
    pub fn assign_at(&self, call: &CallId, now_ms: u64) -> Result<NodeId, DispatchError> {
        match self.registry.place_at(call, &self.agent, now_ms, least_loaded) {
            Ok(node) => {
                info!(call_id = %call, agent = %self.agent, node = %node, "call dispatched");
                Ok(node)
            }
            Err(e) => {
                warn!(call_id = %call, agent = %self.agent, "dispatch failed: {e}");
                Err(e)
            }
        }
    }

    /// Place `call` at the current wall-clock time.
    pub fn assign(&self, call: &CallId) -> Result<NodeId, DispatchError> {
        self.assign_at(call, now_epoch_millis())
    }

    /// Node that signaling for an existing call should be routed to.
    pub fn route(&self, call: &CallId) -> Option<NodeId> {
        self.registry.owner_of(call)
    }
}

/// Fewest sessions first, then lowest identifier.
fn least_loaded(candidates: &[&WorkerNode]) -> Option<NodeId> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.session_count
                .cmp(&b.session_count)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|n| n.id.clone())
}
