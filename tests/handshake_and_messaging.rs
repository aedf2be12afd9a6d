//! End-to-end tests for connecting, handshaking, and direct messaging
//! between nodes wired over the in-process memory transport.

use std::sync::Arc;
use std::time::Duration;

use weft::{CommandPattern, Identity, MemoryHub, Node};

fn spawn_node(hub: &MemoryHub, name: &str, network: &str) -> Node {
    let node = Node::new(Identity::generate(), network);
    node.add_dialer(Arc::new(hub.dialer()));
    node.add_receiver(Arc::new(hub.receiver(name)));
    node
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn connect_learns_mutual_addresses() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "a", "net1");
    let b = spawn_node(&hub, "b", "net1");
    a.start().await.unwrap();
    b.start().await.unwrap();

    let learned = a.connect("memory:b").await.unwrap();
    assert_eq!(learned, b.address());
    assert!(a.is_connected(&b.address()));

    // The responder registers asynchronously, just after its handshake.
    let b2 = b.clone();
    let a_addr = a.address();
    eventually("responder to register the connection", move || {
        b2.is_connected(&a_addr)
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn ping_pong_through_handlers() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "a", "net1");
    let b = spawn_node(&hub, "b", "net1");
    a.start().await.unwrap();
    b.start().await.unwrap();

    b.handle(CommandPattern::Exact("ping".into()), |node, message| {
        Box::pin(async move {
            let origin = message.from.expect("ping without origin");
            node.send(origin, "pong", message.payload)
                .await
                .expect("pong send failed");
        })
    });

    let mut replies = a.messages().await.expect("subscription already taken");
    a.connect("memory:b").await.unwrap();
    a.send(b.address(), "ping", b"are you there".to_vec())
        .await
        .unwrap();

    let pong = tokio::time::timeout(Duration::from_secs(2), replies.recv())
        .await
        .expect("no pong within deadline")
        .expect("subscription closed");
    assert_eq!(pong.command, "pong");
    assert_eq!(pong.payload, b"are you there");
    assert_eq!(pong.from, Some(b.address()));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn network_mismatch_never_establishes() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "a", "net1");
    let b = spawn_node(&hub, "b", "net2");
    a.start().await.unwrap();
    b.start().await.unwrap();

    assert!(a.connect("memory:b").await.is_err());
    assert!(a.peers().is_empty());

    // Give the responder time to have (wrongly) registered anything.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.peers().is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn duplicate_connections_collapse_to_one() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "a", "net1");
    let b = spawn_node(&hub, "b", "net1");
    a.start().await.unwrap();
    b.start().await.unwrap();

    a.connect("memory:b").await.unwrap();
    a.connect("memory:b").await.unwrap();
    assert_eq!(a.peers().len(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn discarded_duplicate_never_evicts_the_surviving_connection() {
    // The duplicate's reader can observe the remote teardown before its
    // abort lands; that close event must not tear down the connection that
    // was kept. Repeated with fresh nodes to give the race room to appear.
    for round in 0..20 {
        let hub = MemoryHub::new();
        let a = spawn_node(&hub, "a", "net1");
        let b = spawn_node(&hub, "b", "net1");
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.connect("memory:b").await.unwrap();
        let b2 = b.clone();
        let a_addr = a.address();
        eventually("responder to register the connection", move || {
            b2.is_connected(&a_addr)
        })
        .await;

        // Second handshake succeeds and is then discarded on both sides.
        a.connect("memory:b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(
            a.is_connected(&b.address()),
            "round {round}: initiator lost its existing connection after duplicate discard"
        );
        assert!(
            b.is_connected(&a.address()),
            "round {round}: responder lost its existing connection after duplicate discard"
        );

        // And the surviving connection still carries traffic.
        a.send(b.address(), "ping", b"still here".to_vec())
            .await
            .unwrap();

        a.stop().await;
        b.stop().await;
    }
}

#[tokio::test]
async fn removed_handler_no_longer_fires() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "a", "net1");
    let b = spawn_node(&hub, "b", "net1");
    a.start().await.unwrap();
    b.start().await.unwrap();

    let id = b.handle(CommandPattern::Exact("ping".into()), |node, message| {
        Box::pin(async move {
            let origin = message.from.unwrap();
            let _ = node.send(origin, "pong", b"x".to_vec()).await;
        })
    });
    b.remove_handler(id);

    let mut replies = a.messages().await.unwrap();
    a.connect("memory:b").await.unwrap();
    a.send(b.address(), "ping", b"hello".to_vec()).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(300), replies.recv()).await;
    assert!(outcome.is_err(), "handler fired after removal");

    a.stop().await;
    b.stop().await;
}
