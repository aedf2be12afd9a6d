//! Two in-process nodes exchanging a ping over the memory transport.

use std::sync::Arc;

use weft::{CommandPattern, Identity, MemoryHub, Node};

#[tokio::main]
async fn main() -> weft::Result<()> {
    let hub = MemoryHub::new();

    let alice = Node::new(Identity::generate(), "demo");
    alice.add_dialer(Arc::new(hub.dialer()));
    alice.add_receiver(Arc::new(hub.receiver("alice")));

    let bob = Node::new(Identity::generate(), "demo");
    bob.add_dialer(Arc::new(hub.dialer()));
    bob.add_receiver(Arc::new(hub.receiver("bob")));

    alice.start().await?;
    bob.start().await?;

    bob.handle(CommandPattern::Exact("ping".into()), |node, message| {
        Box::pin(async move {
            let origin = message.from.expect("ping without origin");
            println!("bob:   ping from {origin}, answering");
            if let Err(err) = node.send(origin, "pong", message.payload).await {
                eprintln!("bob:   could not answer: {err}");
            }
        })
    });

    let mut replies = alice.messages().await.expect("subscription already taken");
    alice.connect("memory:bob").await?;
    println!("alice: connected to {}", bob.address());
    alice
        .send(bob.address(), "ping", b"hello overlay".to_vec())
        .await?;

    if let Some(pong) = replies.recv().await {
        println!(
            "alice: {} from {}: {}",
            pong.command,
            pong.from.expect("pong without origin"),
            String::from_utf8_lossy(&pong.payload)
        );
    }

    alice.stop().await;
    bob.stop().await;
    Ok(())
}
