mod common;

use common::{wait_until, InstantPow, MockConnector, MockNode};
use std::sync::Arc;
use std::time::Duration;
use tangle_spammer::{CtrlOptions, Metric, SpammerCtrl};
use tokio::sync::mpsc;

const NODE_A: &str = "http://node-a.test:14265";
const NODE_B: &str = "http://node-b.test:14265";
const LIMIT: Duration = Duration::from_secs(20);

fn controller(nodes: &[Arc<MockNode>]) -> SpammerCtrl {
    let options = CtrlOptions {
        pow: Some(Arc::new(InstantPow::default())),
        connector: Some(MockConnector::with(nodes)),
        ..Default::default()
    };
    SpammerCtrl::new(NODE_A, options).unwrap()
}

/// Receives until `found` matches, or fails after `LIMIT`.
async fn next_matching(
    rx: &mut mpsc::Receiver<Metric>,
    mut found: impl FnMut(&Metric) -> bool,
) -> Metric {
    tokio::time::timeout(LIMIT, async {
        loop {
            match rx.recv().await {
                Some(metric) if found(&metric) => return metric,
                Some(_) => continue,
                None => panic!("listener channel closed"),
            }
        }
    })
    .await
    .expect("metric not received")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_and_stop() {
    let node = MockNode::new(NODE_A);
    let ctrl = controller(&[Arc::clone(&node)]);

    ctrl.start().await.unwrap();
    let status = ctrl.state().await;
    assert!(status.running);
    assert_eq!(status.node, NODE_A);
    assert_eq!(status.pow_type, "Instant");

    // starting twice is a no-op
    ctrl.start().await.unwrap();

    wait_until(LIMIT, || node.broadcast_count() >= 2).await;
    ctrl.stop().await.unwrap();

    assert!(!ctrl.is_running().await);
    assert_eq!(ctrl.spammer().await.live_tasks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_receives_sent_bundles_and_summaries() {
    let node = MockNode::new(NODE_A);
    let ctrl = controller(&[Arc::clone(&node)]);
    let (_, mut rx) = ctrl.add_metric_listener(1024).await;

    ctrl.start().await.unwrap();

    let sent = next_matching(&mut rx, |m| matches!(m, Metric::SuccessfulTx(_))).await;
    match sent {
        Metric::SuccessfulTx(data) => {
            assert_eq!(data.node, NODE_A);
            assert_eq!(data.count, 1);
            assert_eq!(data.hash.len(), 81);
        }
        other => panic!("unexpected metric {:?}", other),
    }

    let summary = next_matching(&mut rx, |m| {
        matches!(m, Metric::Summary(s) if s.txs_succeeded > 0)
    })
    .await;
    assert!(matches!(summary, Metric::Summary(_)));

    ctrl.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_change_node_restarts_running_spammer() {
    let a = MockNode::new(NODE_A);
    let b = MockNode::new(NODE_B);
    let ctrl = controller(&[Arc::clone(&a), Arc::clone(&b)]);

    ctrl.start().await.unwrap();
    wait_until(LIMIT, || a.broadcast_count() >= 1).await;

    ctrl.change_node(NODE_B).await.unwrap();
    let status = ctrl.state().await;
    assert!(status.running);
    assert_eq!(status.node, NODE_B);

    let sent_to_a = a.broadcast_count();
    wait_until(LIMIT, || b.broadcast_count() >= 2).await;
    ctrl.stop().await.unwrap();

    // the old run was fully stopped before the new one started
    assert_eq!(a.broadcast_count(), sent_to_a);
    assert!(!ctrl.is_running().await);
}

#[tokio::test]
async fn test_change_node_while_stopped_stays_stopped() {
    let ctrl = controller(&[MockNode::new(NODE_A), MockNode::new(NODE_B)]);

    ctrl.change_node(NODE_B).await.unwrap();
    let status = ctrl.state().await;
    assert!(!status.running);
    assert_eq!(status.node, NODE_B);
}

#[tokio::test]
async fn test_change_node_rejects_invalid_url() {
    let ctrl = controller(&[MockNode::new(NODE_A)]);

    assert!(ctrl.change_node("not a url").await.is_err());
    assert_eq!(ctrl.state().await.node, NODE_A);
}

#[tokio::test]
async fn test_change_pow_type() {
    let ctrl = controller(&[MockNode::new(NODE_A)]);

    ctrl.change_pow_type("Curl").await.unwrap();
    assert_eq!(ctrl.state().await.pow_type, "Curl");
    assert!(ctrl.change_pow_type("Keccak").await.is_err());
    assert_eq!(ctrl.state().await.pow_type, "Curl");
    assert!(ctrl.available_pow_types().contains(&"CurlParallel"));
}

#[tokio::test]
async fn test_start_against_unknown_node_fails() {
    let ctrl = controller(&[]);

    assert!(ctrl.start().await.is_err());
    assert!(!ctrl.is_running().await);
}
