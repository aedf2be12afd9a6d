//! Multi-hop delivery: sealed envelopes flooded through intermediaries,
//! with hop budgets and echo suppression.

use std::sync::Arc;
use std::time::Duration;

use weft::{Error, Identity, MemoryDirectory, MemoryHub, Node, RELAY_TTL};

fn spawn_node(hub: &MemoryHub, directory: &MemoryDirectory, name: &str) -> Node {
    let node = Node::new(Identity::generate(), "net1");
    node.add_dialer(Arc::new(hub.dialer()));
    node.add_receiver(Arc::new(hub.receiver(name)));
    node.add_finder(Arc::new(directory.finder()));
    node
}

#[tokio::test]
async fn relay_crosses_a_gateway_with_ttl_accounting() {
    let hub = MemoryHub::new();
    let directory = MemoryDirectory::new();
    let a = spawn_node(&hub, &directory, "a");
    let b = spawn_node(&hub, &directory, "b");
    let c = spawn_node(&hub, &directory, "c");
    for node in [&a, &b, &c] {
        node.start().await.unwrap();
    }

    // A - B - C, no direct A-C connection.
    a.connect("memory:b").await.unwrap();
    b.connect("memory:c").await.unwrap();
    assert!(!a.is_connected(&c.address()));

    let mut delivered = c.messages().await.unwrap();
    a.relay(c.address(), "whisper", b"past the gateway".to_vec())
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
        .await
        .expect("relay never arrived")
        .unwrap();
    assert_eq!(message.command, "whisper");
    assert_eq!(message.payload, b"past the gateway");
    assert_eq!(message.from, Some(a.address()));
    // Two nodes processed the envelope: the gateway and the destination.
    assert_eq!(message.ttl, RELAY_TTL - 2);

    for node in [a, b, c] {
        node.stop().await;
    }
}

#[tokio::test]
async fn diamond_topology_delivers_exactly_once() {
    let hub = MemoryHub::new();
    let directory = MemoryDirectory::new();
    let a = spawn_node(&hub, &directory, "a");
    let b = spawn_node(&hub, &directory, "b");
    let d = spawn_node(&hub, &directory, "d");
    let c = spawn_node(&hub, &directory, "c");
    for node in [&a, &b, &d, &c] {
        node.start().await.unwrap();
    }

    // Two disjoint paths from A to C.
    a.connect("memory:b").await.unwrap();
    a.connect("memory:d").await.unwrap();
    b.connect("memory:c").await.unwrap();
    d.connect("memory:c").await.unwrap();

    let mut delivered = c.messages().await.unwrap();
    a.relay(c.address(), "once", b"no echoes".to_vec())
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
        .await
        .expect("relay never arrived")
        .unwrap();
    assert_eq!(first.command, "once");

    // The copy along the second path must be suppressed.
    let second = tokio::time::timeout(Duration::from_millis(300), delivered.recv()).await;
    assert!(second.is_err(), "duplicate relay delivery");

    for node in [a, b, d, c] {
        node.stop().await;
    }
}

#[tokio::test]
async fn exhausted_hop_budget_drops_the_envelope_silently() {
    let hub = MemoryHub::new();
    let directory = MemoryDirectory::new();
    let a = spawn_node(&hub, &directory, "a");
    let b = spawn_node(&hub, &directory, "b");
    let c = spawn_node(&hub, &directory, "c");
    for node in [&a, &b, &c] {
        node.start().await.unwrap();
    }

    // A - B - C: the destination is two processing nodes away.
    a.connect("memory:b").await.unwrap();
    b.connect("memory:c").await.unwrap();
    assert!(!a.is_connected(&c.address()));

    let mut delivered = c.messages().await.unwrap();

    // Budget 1 is spent at the gateway; the destination sees ttl 0 and
    // drops without a trace.
    a.relay_with_ttl(c.address(), "whisper", b"too far".to_vec(), 1)
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(500), delivered.recv()).await;
    assert!(outcome.is_err(), "envelope outlived its hop budget");

    // Budget 2 covers exactly the gateway and the destination.
    a.relay_with_ttl(c.address(), "whisper", b"just enough".to_vec(), 2)
        .await
        .unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
        .await
        .expect("relay never arrived")
        .unwrap();
    assert_eq!(message.payload, b"just enough");
    assert_eq!(message.ttl, 0);

    for node in [a, b, c] {
        node.stop().await;
    }
}

#[tokio::test]
async fn relay_to_an_unknown_address_fails_fast() {
    let hub = MemoryHub::new();
    let directory = MemoryDirectory::new();
    let a = spawn_node(&hub, &directory, "a");
    a.start().await.unwrap();

    let stranger = Identity::generate();
    let outcome = a
        .relay(stranger.address(), "whisper", b"x".to_vec())
        .await;
    assert!(matches!(outcome, Err(Error::NotFound(_))));

    a.stop().await;
}

#[tokio::test]
async fn relay_to_a_direct_neighbor_still_delivers() {
    let hub = MemoryHub::new();
    let directory = MemoryDirectory::new();
    let a = spawn_node(&hub, &directory, "a");
    let b = spawn_node(&hub, &directory, "b");
    a.start().await.unwrap();
    b.start().await.unwrap();
    a.connect("memory:b").await.unwrap();

    let mut delivered = b.messages().await.unwrap();
    a.relay(b.address(), "near", b"one hop".to_vec()).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
        .await
        .expect("relay never arrived")
        .unwrap();
    assert_eq!(message.command, "near");
    assert_eq!(message.ttl, RELAY_TTL - 1);

    a.stop().await;
    b.stop().await;
}
