//! Fleet behaviour: dispatch, eviction and worker-hosted calls.

use crate::helpers::{scripted_stages, test_config};
use siphon::audio::ChannelTransport;
use siphon::call::{CallId, EndReason};
use siphon::config::FleetConfig;
use siphon::error::DispatchError;
use siphon::fleet::{Dispatcher, NodeId, RegistryEvent, WorkerHost, WorkerRegistry};
use siphon::SessionOrchestrator;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const AGENT: &str = "front-desk";

fn registry(interval_ms: u64) -> Arc<WorkerRegistry> {
    Arc::new(WorkerRegistry::new(FleetConfig {
        worker_heartbeat_interval_ms: interval_ms,
        worker_eviction_threshold: 3,
    }))
}

#[test]
fn silent_worker_is_evicted_and_its_calls_orphaned() {
    let registry = registry(1_000);
    let dispatcher = Dispatcher::new(Arc::clone(&registry), AGENT);
    let mut events = registry.subscribe();
    for node in ["w1", "w2", "w3"] {
        registry.register_at(NodeId::from(node), format!("{node}:7000"), AGENT, 0);
    }

    let calls: Vec<CallId> = (0..6).map(|i| CallId::from(format!("call-{i}"))).collect();
    let mut placed: BTreeMap<NodeId, Vec<CallId>> = BTreeMap::new();
    for call in &calls {
        let node = dispatcher.assign_at(call, 0).unwrap();
        placed.entry(node).or_default().push(call.clone());
    }
    assert!(placed.values().all(|calls| calls.len() == 2));

    // w2 stops heartbeating; the others keep going.
    for beat in 1..=3_u64 {
        for node in ["w1", "w3"] {
            registry.heartbeat_at(&NodeId::from(node), 2, beat * 1_000).unwrap();
        }
        let evicted = registry.sweep_at(beat * 1_000);
        if beat < 3 {
            assert!(evicted.is_empty(), "evicted too early at beat {beat}");
        } else {
            assert_eq!(evicted.len(), 1);
            assert_eq!(evicted[0].node, NodeId::from("w2"));
        }
    }

    let w2_calls = &placed[&NodeId::from("w2")];
    assert_eq!(registry.orphaned_calls(), *w2_calls);
    for call in w2_calls {
        assert_eq!(dispatcher.route(call), None);
    }
    assert!(registry.node(&NodeId::from("w2")).is_none());

    // New calls only land on the survivors.
    let next = dispatcher.assign_at(&CallId::from("call-6"), 3_000).unwrap();
    assert_ne!(next, NodeId::from("w2"));

    // An orphaned call can be placed again.
    let moved = dispatcher.assign_at(&w2_calls[0], 3_000).unwrap();
    assert_ne!(moved, NodeId::from("w2"));
    assert_eq!(dispatcher.route(&w2_calls[0]), Some(moved));

    let evicted_event = std::iter::from_fn(|| events.try_recv().ok())
        .find(|e| matches!(e, RegistryEvent::NodeEvicted { .. }))
        .expect("eviction should be broadcast");
    assert_eq!(
        evicted_event,
        RegistryEvent::NodeEvicted {
            node: NodeId::from("w2"),
            orphaned: w2_calls.clone(),
        }
    );
}

#[test]
fn empty_fleet_rejects_calls() {
    let dispatcher = Dispatcher::new(registry(1_000), AGENT);
    assert_eq!(
        dispatcher.assign(&CallId::new()).unwrap_err(),
        DispatchError::NoLiveWorkers
    );
}

#[tokio::test]
async fn worker_hosts_dispatched_calls_until_they_end() {
    let registry = registry(20);
    let dispatcher = Dispatcher::new(Arc::clone(&registry), AGENT);
    let hosts: BTreeMap<NodeId, WorkerHost> = ["w1", "w2"]
        .into_iter()
        .map(|id| {
            let host =
                WorkerHost::new(NodeId::from(id), format!("{id}:7000"), AGENT, Arc::clone(&registry));
            host.start();
            (NodeId::from(id), host)
        })
        .collect();

    let config = test_config();
    let mut running = Vec::new();
    let mut callers = Vec::new();
    for i in 0..4 {
        let call = CallId::from(format!("call-{i}"));
        let node = dispatcher.assign(&call).unwrap();
        let (stages, _llm) = scripted_stages(&config, &[], &[]);
        let (transport, caller) = ChannelTransport::pair(&config.transport);
        let session = SessionOrchestrator::new(config.clone(), call, stages, Arc::new(transport));
        running.push(hosts[&node].host(session));
        callers.push(caller);
    }
    for node in registry.nodes() {
        assert_eq!(node.session_count, 2);
    }
    tokio::time::sleep(Duration::from_millis(60)).await;
    for node in registry.nodes() {
        assert_eq!(node.reported_sessions, 2, "{} should report its calls", node.id);
    }

    // Every caller hangs up.
    callers.clear();
    for handle in running {
        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("call should end")
            .unwrap()
            .unwrap();
        assert_eq!(summary.call.end_reason, Some(EndReason::HungUp));
        assert!(summary.call.worker.is_some());
    }
    for node in registry.nodes() {
        assert_eq!(node.session_count, 0);
    }

    // Draining w1 sends new calls to w2 and removes w1 at once, since it is idle.
    hosts[&NodeId::from("w1")].drain().unwrap();
    assert!(registry.node(&NodeId::from("w1")).is_none());
    assert_eq!(
        dispatcher.assign(&CallId::from("late")).unwrap(),
        NodeId::from("w2")
    );

    for host in hosts.values() {
        host.shutdown().await;
    }
    assert!(registry.nodes().is_empty());
}
