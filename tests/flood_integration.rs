//! Integration tests for topic messaging between running nodes.
//!
//! Nodes find each other through provider records and then flood every
//! published message to their connected peers.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::timeout;
use topicmesh::{Config, Identity, Message, MessageStream, Node};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

async fn start(topic: &str, seeds: &[&Node]) -> Node {
    let config = Config {
        bind: "127.0.0.1:0".into(),
        bootstrap_peers: seeds.iter().map(|n| n.bootstrap_string()).collect(),
        topic_name: topic.into(),
        provide_timeout_ms: 2_000,
        find_timeout_ms: 2_000,
        dial_timeout_ms: 1_000,
        query_timeout_ms: 1_000,
        ..Config::default()
    };
    timeout(TEST_TIMEOUT, Node::start(config))
        .await
        .expect("startup finished in time")
        .expect("node started")
}

async fn wait_for_mesh(nodes: &[&Node]) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        let complete = nodes.iter().all(|node| {
            let connected: HashSet<Identity> = node.connected_peers().iter().map(|c| c.identity).collect();
            nodes
                .iter()
                .filter(|other| other.identity() != node.identity())
                .all(|other| connected.contains(&other.identity()))
        });
        if complete {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "nodes never formed a full mesh");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn collect(stream: &mut MessageStream, count: usize) -> Vec<Message> {
    let mut received = Vec::with_capacity(count);
    while received.len() < count {
        let msg = timeout(TEST_TIMEOUT, stream.recv())
            .await
            .expect("message arrived in time")
            .expect("stream open");
        received.push(msg);
    }
    received
}

async fn assert_quiet(stream: &mut MessageStream) {
    tokio::time::sleep(QUIET_PERIOD).await;
    if let Some(extra) = stream.try_recv() {
        panic!("unexpected extra delivery: {extra:?}");
    }
}

#[tokio::test]
async fn every_node_sees_every_message_once() {
    let a = start("chat", &[]).await;
    let b = start("chat", &[&a]).await;
    let c = start("chat", &[&b]).await;
    wait_for_mesh(&[&a, &b, &c]).await;

    let mut streams = [
        a.messages().await.expect("a"),
        b.messages().await.expect("b"),
        c.messages().await.expect("c"),
    ];

    a.publish(b"from a".to_vec()).await.expect("publish a");
    b.publish(b"from b".to_vec()).await.expect("publish b");
    c.publish(b"from c".to_vec()).await.expect("publish c");

    let expected: HashSet<Vec<u8>> = [b"from a".to_vec(), b"from b".to_vec(), b"from c".to_vec()]
        .into_iter()
        .collect();
    for stream in streams.iter_mut() {
        let received = collect(stream, 3).await;
        let payloads: HashSet<Vec<u8>> = received.iter().map(|m| m.data.clone()).collect();
        assert_eq!(payloads, expected);
        assert!(received.iter().all(|m| m.topic == "chat"));
        assert_quiet(stream).await;
    }

    for node in [&c, &b, &a] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn identical_payloads_from_two_publishers_are_both_delivered() {
    let a = start("dupes", &[]).await;
    let b = start("dupes", &[&a]).await;
    let c = start("dupes", &[&a]).await;
    wait_for_mesh(&[&a, &b, &c]).await;

    let mut stream = c.messages().await.expect("stream");
    a.publish(b"same words".to_vec()).await.expect("publish a");
    b.publish(b"same words".to_vec()).await.expect("publish b");

    let received = collect(&mut stream, 2).await;
    let senders: HashSet<String> = received.iter().map(|m| m.from.clone()).collect();
    let expected: HashSet<String> = [a.identity().to_hex(), b.identity().to_hex()].into_iter().collect();
    assert_eq!(senders, expected);
    assert!(received.iter().all(|m| m.data == b"same words"));
    assert_quiet(&mut stream).await;

    for node in [&c, &b, &a] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn other_topics_are_relayed_but_not_delivered() {
    let a = start("alpha", &[]).await;
    let b = start("beta", &[&a]).await;
    wait_for_mesh(&[&a, &b]).await;

    let mut beta_stream = b.messages().await.expect("stream");
    a.publish(b"alpha only".to_vec()).await.expect("publish");

    assert_quiet(&mut beta_stream).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn shut_down_peer_does_not_stop_delivery_to_others() {
    let a = start("churn", &[]).await;
    let b = start("churn", &[&a]).await;
    let c = start("churn", &[&a]).await;
    wait_for_mesh(&[&a, &b, &c]).await;

    let mut stream = c.messages().await.expect("stream");
    b.shutdown().await;

    a.publish(b"still here".to_vec()).await.expect("publish");
    let received = collect(&mut stream, 1).await;
    assert_eq!(received[0].data, b"still here");
    assert_eq!(received[0].from, a.identity().to_hex());

    c.shutdown().await;
    a.shutdown().await;
}
