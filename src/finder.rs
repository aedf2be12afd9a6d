//! Peer discovery: the [`Finder`] trait and the two built-in finders.
//!
//! A finder answers one question: given an address, produce a current
//! advertisement for it, or report that it has none. The registry races all
//! attached finders and keeps the first acceptable answer, so a finder only
//! needs to be correct, not fast, and `Ok(None)` ("I checked, nothing") is
//! meaningfully different from hanging until the registry's deadline.
//!
//! | Finder | Looks in |
//! |--------|----------|
//! | [`MemoryFinder`] | a shared in-process [`MemoryDirectory`] |
//! | [`PeerFinder`] | the caches of already-connected peers, over the overlay itself |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identity::Address;
use crate::message::Message;
use crate::node::{CommandPattern, HandlerId, Node};
use crate::peer::{Advertisement, Peer};

/// A source of peer advertisements.
#[async_trait]
pub trait Finder: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Looks the address up. `Ok(None)` means this finder is certain it has
    /// no match; an implementation that cannot conclude that may simply not
    /// return until the registry's deadline cuts it off.
    async fn find(&self, address: &Address) -> Result<Option<Advertisement>>;

    /// Called once when the owning node starts.
    async fn up(&self, node: &Node) -> Result<()> {
        let _ = node;
        Ok(())
    }

    /// Called once when the owning node stops.
    async fn down(&self) {}
}

// ============================================================================
// Memory finder
// ============================================================================

/// Shared in-process directory of running nodes, for tests and examples.
/// Nodes that should discover each other attach finders from the same
/// directory.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    nodes: Arc<Mutex<HashMap<Address, Node>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finder(&self) -> MemoryFinder {
        MemoryFinder {
            directory: self.clone(),
            registered: Mutex::new(None),
        }
    }
}

/// Resolves addresses against a [`MemoryDirectory`]. Registers its own node
/// in the directory on `up` and withdraws it on `down`.
pub struct MemoryFinder {
    directory: MemoryDirectory,
    registered: Mutex<Option<Address>>,
}

#[async_trait]
impl Finder for MemoryFinder {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find(&self, address: &Address) -> Result<Option<Advertisement>> {
        let advertisement = self
            .directory
            .nodes
            .lock()
            .expect("memory directory lock poisoned")
            .get(address)
            .map(Node::advertisement);
        Ok(advertisement)
    }

    async fn up(&self, node: &Node) -> Result<()> {
        let address = node.address();
        self.directory
            .nodes
            .lock()
            .expect("memory directory lock poisoned")
            .insert(address, node.clone());
        *self.registered.lock().expect("memory finder lock poisoned") = Some(address);
        Ok(())
    }

    async fn down(&self) {
        let registered = self
            .registered
            .lock()
            .expect("memory finder lock poisoned")
            .take();
        if let Some(address) = registered {
            self.directory
                .nodes
                .lock()
                .expect("memory directory lock poisoned")
                .remove(&address);
        }
    }
}

// ============================================================================
// Peer finder
// ============================================================================

const COMMAND_REQUEST: &str = "peerfinder.req";
const COMMAND_RESPONSE: &str = "peerfinder.res";

type Pending = Arc<Mutex<Vec<(Address, oneshot::Sender<Advertisement>)>>>;

/// Asks already-connected peers: broadcasts a query and resolves on the
/// first response naming the queried address. Peers answer out of their own
/// registry caches (or with their own advertisement), so this finder
/// discovers anything a neighbor already knows.
///
/// A query with no positive answer never resolves on its own; the
/// registry's deadline bounds it. Stale waiters are pruned whenever a
/// response comes in.
#[derive(Default)]
pub struct PeerFinder {
    node: Mutex<Option<Node>>,
    handler: Mutex<Option<HandlerId>>,
    pending: Pending,
}

impl PeerFinder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Finder for PeerFinder {
    fn name(&self) -> &str {
        "peerfinder"
    }

    async fn find(&self, address: &Address) -> Result<Option<Advertisement>> {
        let node = self
            .node
            .lock()
            .expect("peer finder lock poisoned")
            .clone()
            .ok_or(Error::State("peer finder is not attached to a node"))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("peer finder lock poisoned")
            .push((*address, tx));

        node.broadcast(COMMAND_REQUEST, address.to_hex().into_bytes())
            .await?;

        // Resolved by the response handler, or abandoned when the registry
        // gives up on us and drops the receiver.
        match rx.await {
            Ok(advertisement) => Ok(Some(advertisement)),
            Err(_) => Ok(None),
        }
    }

    async fn up(&self, node: &Node) -> Result<()> {
        let pending = Arc::clone(&self.pending);
        let id = node.handle(
            CommandPattern::Prefix("peerfinder.".into()),
            move |node, message| {
                let pending = Arc::clone(&pending);
                Box::pin(async move {
                    match message.command.as_str() {
                        COMMAND_REQUEST => answer_request(node, message).await,
                        COMMAND_RESPONSE => resolve_response(&pending, &message),
                        other => debug!(command = other, "ignoring unknown peerfinder command"),
                    }
                })
            },
        );
        *self.node.lock().expect("peer finder lock poisoned") = Some(node.clone());
        *self.handler.lock().expect("peer finder lock poisoned") = Some(id);
        Ok(())
    }

    async fn down(&self) {
        let node = self.node.lock().expect("peer finder lock poisoned").take();
        let handler = self.handler.lock().expect("peer finder lock poisoned").take();
        if let (Some(node), Some(id)) = (node, handler) {
            node.remove_handler(id);
        }
        self.pending
            .lock()
            .expect("peer finder lock poisoned")
            .clear();
    }
}

/// Answers a query out of our own advertisement or registry cache. Silence
/// is the negative answer.
async fn answer_request(node: Node, message: Message) {
    let Some(origin) = message.from else {
        return;
    };
    // Answers only travel back over the connection the query arrived on.
    // Without this check a vanished origin would push the reply into
    // on-demand dialing and discovery, stalling the dispatch task.
    if !node.is_connected(&origin) {
        debug!(peer = %origin, "dropping peerfinder query from a disconnected origin");
        return;
    }
    let queried = std::str::from_utf8(&message.payload)
        .ok()
        .and_then(|hex| Address::from_hex(hex).ok());
    let Some(queried) = queried else {
        warn!(peer = %origin, "malformed peerfinder query");
        return;
    };

    let answer = if queried == node.address() {
        Some(node.advertisement())
    } else {
        node.registry().get(&queried)
    };
    let Some(advertisement) = answer else {
        return;
    };

    let payload = match serde_json::to_vec(&advertisement) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%err, "failed to encode peerfinder response");
            return;
        }
    };
    if let Err(err) = node.send(origin, COMMAND_RESPONSE, payload).await {
        debug!(peer = %origin, %err, "failed to answer peerfinder query");
    }
}

/// Routes a response to the first waiter for that address, dropping waiters
/// whose finds have already been abandoned.
fn resolve_response(pending: &Pending, message: &Message) {
    let advertisement: Advertisement = match serde_json::from_slice(&message.payload) {
        Ok(advertisement) => advertisement,
        Err(err) => {
            warn!(%err, "malformed peerfinder response");
            return;
        }
    };
    let peer = match Peer::from_advertisement(&advertisement) {
        Ok(peer) => peer,
        Err(err) => {
            warn!(%err, "discarding inauthentic peerfinder response");
            return;
        }
    };

    let mut pending = pending.lock().expect("peer finder lock poisoned");
    pending.retain(|(_, tx)| !tx.is_closed());
    if let Some(at) = pending
        .iter()
        .position(|(address, _)| *address == peer.address())
    {
        let (_, tx) = pending.remove(at);
        let _ = tx.send(advertisement);
    }
}
