//! Fan-out dispatcher behavior over a scripted outbound substrate.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use callmux::metrics::{
    RPC_COUNT, RPC_ERRORS, RPC_LATENCY, STATUS_ERROR, STATUS_SUCCESS, STATUS_TAG,
};
use callmux::{CallError, FanOut, InMemoryMetrics, PeerId, PeerOutcome};

use common::{init_tracing, peers, ScriptedPeers};

#[tokio::test]
async fn test_count_invariant() {
    init_tracing();

    for n in [0usize, 1, 7, 50] {
        let names: Vec<PeerId> = (0..n).map(|i| PeerId::new(format!("peer-{i}"))).collect();
        let fan_out = FanOut::new(ScriptedPeers::new());

        let report = fan_out
            .dispatch_report(names.clone(), |_| 1)
            .await
            .expect("dispatch");

        assert_eq!(report.consumed(), n);
        assert_eq!(report.len(), n);
        assert_eq!(fan_out.substrate().issued().len(), n);
        for name in &names {
            assert_eq!(report.outcome(name), Some(&PeerOutcome::Value(2)));
        }
    }
}

#[tokio::test]
async fn test_no_peers_returns_empty_map() {
    let fan_out = FanOut::new(ScriptedPeers::new());
    let outcomes = fan_out.dispatch(Vec::new(), |_| 0).await.expect("dispatch");
    assert!(outcomes.is_empty());
    assert!(fan_out.substrate().issued().is_empty());
}

#[tokio::test]
async fn test_partial_failure_isolation() {
    let names: Vec<PeerId> = (0..10).map(|i| PeerId::new(format!("p{i}"))).collect();
    let substrate = ScriptedPeers::new()
        .failing("p1")
        .failing("p4")
        .failing("p7");
    let fan_out = FanOut::new(substrate);

    let outcomes = fan_out.dispatch(names, |_| 41).await.expect("dispatch");

    let failed: HashSet<&str> = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.is_failed())
        .map(|(peer, _)| peer.as_str())
        .collect();
    assert_eq!(failed, HashSet::from(["p1", "p4", "p7"]));
    assert_eq!(outcomes.len(), 10);
    for (peer, outcome) in &outcomes {
        if !failed.contains(peer.as_str()) {
            assert_eq!(outcome, &PeerOutcome::Value(42));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_three_peers_with_middle_failing() {
    init_tracing();
    let substrate = ScriptedPeers::new()
        .failing("B")
        .delay("A", Duration::from_millis(30))
        .delay("B", Duration::from_millis(10))
        .delay("C", Duration::from_millis(20));
    let fan_out = FanOut::new(substrate);

    let report = fan_out
        .dispatch_report(peers(&["A", "B", "C"]), |_| 9)
        .await
        .expect("dispatch");

    assert_eq!(report.consumed(), 3);
    assert_eq!(report.completion_order(), &peers(&["B", "C", "A"])[..]);
    assert_eq!(report.outcome(&PeerId::from("A")), Some(&PeerOutcome::Value(10)));
    assert_eq!(
        report.outcome(&PeerId::from("B")),
        Some(&PeerOutcome::Failed(CallError::Unavailable))
    );
    assert_eq!(report.outcome(&PeerId::from("C")), Some(&PeerOutcome::Value(10)));
    assert_eq!(report.latency(&PeerId::from("A")), Some(Duration::from_millis(30)));
}

#[tokio::test]
async fn test_tag_integrity() {
    let fan_out = FanOut::new(ScriptedPeers::new().failing("y"));

    let report = fan_out
        .dispatch_report(peers(&["x", "y", "z"]), |_| 0)
        .await
        .expect("dispatch");

    let issued = fan_out.substrate().issued();
    assert_eq!(issued.len(), 3);
    for (peer, tag) in issued {
        assert_eq!(report.tag(&peer), Some(tag));
    }
}

#[tokio::test]
async fn test_duplicate_peers_issue_once() {
    let fan_out = FanOut::new(ScriptedPeers::new());

    let outcomes = fan_out
        .dispatch_shared(peers(&["a", "b", "a", "b", "c"]), &5)
        .await
        .expect("dispatch");

    assert_eq!(outcomes.len(), 3);
    assert_eq!(fan_out.substrate().issued().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_labelled_by_outcome() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let substrate = ScriptedPeers::new()
        .failing("bad")
        .delay("fast", Duration::from_millis(10))
        .delay("slow", Duration::from_millis(20))
        .delay("bad", Duration::from_millis(5));
    let fan_out = FanOut::new(substrate).with_metrics(metrics.clone());

    fan_out
        .dispatch(peers(&["fast", "slow", "bad"]), |_| 1)
        .await
        .expect("dispatch");

    let success = [(STATUS_TAG, STATUS_SUCCESS)];
    let error = [(STATUS_TAG, STATUS_ERROR)];
    assert_eq!(metrics.count(RPC_COUNT, &success), 2);
    assert_eq!(metrics.count(RPC_COUNT, &error), 1);
    assert_eq!(metrics.count(RPC_ERRORS, &error), 1);
    assert_eq!(metrics.count(RPC_ERRORS, &success), 0);
    assert_eq!(metrics.latency_observations(RPC_LATENCY), 3);

    let histogram = metrics.histogram(RPC_LATENCY, &success).expect("success latencies");
    assert_eq!(histogram.mean(), Some(15.0));
    let histogram = metrics.histogram(RPC_LATENCY, &error).expect("error latencies");
    assert_eq!(histogram.max(), Some(5.0));
}

#[tokio::test]
async fn test_concurrent_dispatches_share_a_fan_out() {
    let fan_out = Arc::new(FanOut::new(ScriptedPeers::new().failing("b")));

    let first = {
        let fan_out = Arc::clone(&fan_out);
        tokio::spawn(async move { fan_out.dispatch(peers(&["a", "b"]), |_| 1).await })
    };
    let second = {
        let fan_out = Arc::clone(&fan_out);
        tokio::spawn(async move { fan_out.dispatch(peers(&["b", "c", "d"]), |_| 2).await })
    };

    let first = first.await.expect("join").expect("dispatch");
    let second = second.await.expect("join").expect("dispatch");
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 3);
    assert_eq!(second[&PeerId::from("c")], PeerOutcome::Value(3));
}
