//! The node: identity, connections, discovery, and routing under one roof.
//!
//! A [`Node`] is cheaply cloneable (it is an `Arc` inside) and wires the
//! other layers together:
//!
//! | Concern | Mechanism |
//! |---------|-----------|
//! | reachability | [`Dialer`]s out, [`Receiver`]s in |
//! | discovery | a [`Registry`] racing [`Finder`]s |
//! | direct traffic | [`Node::send`] / [`Node::broadcast`], always signed + encrypted |
//! | multi-hop traffic | [`Node::relay`], loop-bounded flooding of sealed envelopes |
//! | consumption | [`Node::handle`] callbacks and the [`Node::messages`] subscriber |
//!
//! All inbound traffic funnels through a single dispatch task, so handlers
//! run one at a time and never race each other. A handler that needs to
//! block on further network round-trips (as the peer finder's machinery
//! does) must not starve dispatch; anything of that shape is pushed to a
//! spawned task that re-injects its result as a delivery event.
//!
//! ## Relay
//!
//! A relayed message is an ordinary sealed message encoded whole into the
//! payload of a plain `"relay"` envelope. Each node that processes the
//! envelope drops it silently at ttl 0, decrements the ttl, and then either
//! unwraps it (we are the destination), hands it straight to a direct
//! connection to the destination, or re-floods it to all neighbors except
//! the one it came from and the origin. A small LRU of recently seen
//! envelopes keeps floods from echoing. Delivery is verify-then-decrypt
//! against the origin's identity, resolved through the registry; an
//! envelope whose origin cannot be resolved is dropped, never delivered
//! unverified.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, HandshakeRole};
use crate::error::{Error, Result};
use crate::finder::Finder;
use crate::identity::{Address, Identity};
use crate::message::Message;
use crate::peer::{Advertisement, Peer};
use crate::registry::{FindOptions, Registry};
use crate::transport::{BoxedByteStream, Dialer, Receiver};

pub(crate) const COMMAND_RELAY: &str = "relay";

/// Hop budget stamped on a fresh relay envelope.
pub const RELAY_TTL: u8 = 8;

/// Recently seen relay envelopes remembered for echo suppression.
const RELAY_SEEN_CAPACITY: usize = 10;

/// Inbound events buffered ahead of the dispatch task.
const INBOUND_BUFFER: usize = 64;

/// Deliveries buffered for the [`Node::messages`] subscriber.
const SUBSCRIBER_BUFFER: usize = 64;

/// Accepted streams buffered per receiver ahead of their handshakes.
const ACCEPT_BUFFER: usize = 16;

/// Events feeding the dispatch task.
pub(crate) enum Inbound {
    /// A verified, decrypted message off an established connection.
    Frame { from: Address, message: Message },
    /// A message produced internally, e.g. an unwrapped relay.
    Delivery(Message),
    /// A connection's reader finished. Carries the connection id so the
    /// event only ever tears down that exact connection.
    Closed { address: Address, id: u64 },
}

/// Dedup key for a relay envelope: origin, destination, and a signature
/// prefix of the sealed inner message.
type RelayKey = (Option<Address>, Option<Address>, [u8; 8]);

type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Which commands a handler wants.
pub enum CommandPattern {
    Exact(String),
    Prefix(String),
    Predicate(Box<dyn Fn(&str) -> bool + Send + Sync>),
}

impl CommandPattern {
    fn matches(&self, command: &str) -> bool {
        match self {
            CommandPattern::Exact(exact) => command == exact,
            CommandPattern::Prefix(prefix) => command.starts_with(prefix.as_str()),
            CommandPattern::Predicate(predicate) => predicate(command),
        }
    }
}

/// Token returned by [`Node::handle`], used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: HandlerId,
    pattern: CommandPattern,
    callback: Box<dyn Fn(Node, Message) -> HandlerFuture + Send + Sync>,
}

struct NodeInner {
    identity: Arc<Identity>,
    network_id: String,
    registry: Registry,
    dialers: Mutex<Vec<Arc<dyn Dialer>>>,
    receivers: Mutex<Vec<Arc<dyn Receiver>>>,
    connections: Mutex<HashMap<Address, Arc<Connection>>>,
    handlers: Mutex<Vec<Arc<HandlerEntry>>>,
    next_handler: AtomicU64,
    relay_seen: Mutex<LruCache<RelayKey, ()>>,
    running: AtomicBool,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: TakeOnce<Inbound>,
    subscriber_tx: mpsc::Sender<Message>,
    subscriber_rx: TakeOnce<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// A new, stopped node. Attach transports and finders, then
    /// [`start`](Self::start).
    pub fn new(identity: Identity, network_id: impl Into<String>) -> Self {
        let network_id = network_id.into();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (subscriber_tx, subscriber_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        Self {
            inner: Arc::new(NodeInner {
                identity: Arc::new(identity),
                registry: Registry::new(network_id.clone()),
                network_id,
                dialers: Mutex::new(Vec::new()),
                receivers: Mutex::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(0),
                relay_seen: Mutex::new(LruCache::new(
                    NonZeroUsize::new(RELAY_SEEN_CAPACITY).expect("nonzero capacity"),
                )),
                running: AtomicBool::new(false),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(Some(inbound_rx)),
                subscriber_tx,
                subscriber_rx: tokio::sync::Mutex::new(Some(subscriber_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.inner.identity.address()
    }

    pub fn network_id(&self) -> &str {
        &self.inner.network_id
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Current self-description: identity plus every receiver URL.
    pub fn advertisement(&self) -> Advertisement {
        let urls = self
            .inner
            .receivers
            .lock()
            .expect("node lock poisoned")
            .iter()
            .flat_map(|receiver| receiver.urls())
            .collect();
        Advertisement::new(&self.inner.identity, &self.inner.network_id, urls)
    }

    pub fn add_dialer(&self, dialer: Arc<dyn Dialer>) {
        self.inner
            .dialers
            .lock()
            .expect("node lock poisoned")
            .push(dialer);
    }

    pub fn add_receiver(&self, receiver: Arc<dyn Receiver>) {
        self.inner
            .receivers
            .lock()
            .expect("node lock poisoned")
            .push(receiver);
    }

    pub fn add_finder(&self, finder: Arc<dyn Finder>) {
        self.inner.registry.add_finder(finder);
    }

    /// Registers a handler. Each delivered message goes to the first
    /// handler (in registration order) whose pattern matches its command;
    /// handlers run on the dispatch task, one at a time. Messages no
    /// handler matches fall through to [`Node::messages`].
    pub fn handle<F>(&self, pattern: CommandPattern, callback: F) -> HandlerId
    where
        F: Fn(Node, Message) -> HandlerFuture + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .lock()
            .expect("node lock poisoned")
            .push(Arc::new(HandlerEntry {
                id,
                pattern,
                callback: Box::new(callback),
            }));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.inner
            .handlers
            .lock()
            .expect("node lock poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Takes the subscription for messages no handler matched. There is
    /// exactly one; a second call returns `None`. Deliveries overflow
    /// silently while no one is consuming.
    pub async fn messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.subscriber_rx.lock().await.take()
    }

    /// Peers with an established connection right now.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner
            .connections
            .lock()
            .expect("node lock poisoned")
            .values()
            .map(|connection| connection.peer().clone())
            .collect()
    }

    pub fn is_connected(&self, address: &Address) -> bool {
        self.inner
            .connections
            .lock()
            .expect("node lock poisoned")
            .contains_key(address)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts dispatch, brings receivers and finders up. A node starts at
    /// most once; stopped nodes are not restartable.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::State("node is already running"));
        }
        let inbound_rx = self
            .inner
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or(Error::State("node cannot be restarted"))?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_dispatch(self.clone(), inbound_rx)));

        let outcome = async {
            for receiver in self.snapshot_receivers() {
                let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BUFFER);
                receiver.up(accept_tx).await?;
                tasks.push(tokio::spawn(run_acceptor(self.clone(), accept_rx)));
            }
            self.inner.registry.up(self).await
        }
        .await;
        if let Err(err) = outcome {
            // A half-started node leaves nothing behind.
            for task in &tasks {
                task.abort();
            }
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        self.inner
            .tasks
            .lock()
            .expect("node lock poisoned")
            .extend(tasks);

        info!(address = %self.address(), network = %self.inner.network_id, "node started");
        Ok(())
    }

    /// Stops accepting, tears down finders and every connection. Terminal.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.registry.down().await;
        for receiver in self.snapshot_receivers() {
            receiver.down().await;
        }
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .expect("node lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.inner
            .connections
            .lock()
            .expect("node lock poisoned")
            .clear();
        info!(address = %self.address(), "node stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::State("node is not running"))
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Dials a URL, runs the initiator handshake, and registers the
    /// resulting connection. Returns the authenticated peer address.
    pub async fn connect(&self, url: &str) -> Result<Address> {
        self.ensure_running()?;
        let dialer = self.dialer_for(url)?;
        let stream = dialer.dial(url).await?;
        let connection = Connection::establish(
            stream,
            Arc::clone(&self.inner.identity),
            self.advertisement(),
            HandshakeRole::Initiator,
            self.inner.inbound_tx.clone(),
        )
        .await?;
        self.register_connection(connection)
    }

    fn dialer_for(&self, url: &str) -> Result<Arc<dyn Dialer>> {
        let dialers = self.inner.dialers.lock().expect("node lock poisoned");
        dialers
            .iter()
            .find(|dialer| {
                url.starts_with(dialer.proto()) && url[dialer.proto().len()..].starts_with(':')
            })
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("no dialer for url {url:?}")))
    }

    fn register_connection(&self, connection: Connection) -> Result<Address> {
        let peer = connection.peer().clone();
        let address = peer.address();
        if address == self.address() {
            return Err(Error::State("refusing a connection to self"));
        }
        {
            let mut connections = self.inner.connections.lock().expect("node lock poisoned");
            if connections.contains_key(&address) {
                // Keep the established one; the duplicate closes on drop.
                debug!(peer = %address, "discarding duplicate connection");
                return Ok(address);
            }
            connections.insert(address, Arc::new(connection));
        }
        if let Err(err) = self.inner.registry.put(peer.advertisement()) {
            warn!(peer = %address, %err, "could not cache peer advertisement");
        }
        info!(peer = %address, "connection established");
        Ok(address)
    }

    fn connection(&self, address: &Address) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .lock()
            .expect("node lock poisoned")
            .get(address)
            .cloned()
    }

    /// Drops the registered connection for `address`, but only if it is the
    /// one the teardown event was produced by. A duplicate connection that
    /// was discarded at registration may still observe the remote teardown;
    /// its event must not evict the surviving connection.
    fn remove_connection(&self, address: &Address, id: u64) {
        let mut connections = self.inner.connections.lock().expect("node lock poisoned");
        if connections
            .get(address)
            .is_some_and(|connection| connection.id() == id)
        {
            connections.remove(address);
            debug!(peer = %address, "connection closed");
        }
    }

    fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .connections
            .lock()
            .expect("node lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn snapshot_receivers(&self) -> Vec<Arc<dyn Receiver>> {
        self.inner
            .receivers
            .lock()
            .expect("node lock poisoned")
            .clone()
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Sends a sealed message to one peer, connecting on demand: an
    /// existing connection is reused, otherwise the address is resolved
    /// through the registry and its URLs dialed in order.
    pub async fn send(&self, to: Address, command: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_running()?;
        if to == self.address() {
            return Err(Error::State("cannot send to self"));
        }
        let connection = match self.connection(&to) {
            Some(connection) => connection,
            None => self.dial_address(&to).await?,
        };

        let mut message = Message::new(command).with_to(to).with_payload(payload);
        message.from = Some(self.address());
        message.encrypt(connection.peer().identity())?;
        message.sign(&self.inner.identity)?;
        connection.write(message).await
    }

    async fn dial_address(&self, to: &Address) -> Result<Arc<Connection>> {
        let advertisement = self.inner.registry.find(to, FindOptions::default()).await?;
        let peer = Peer::from_advertisement(&advertisement)?;
        let protos: Vec<String> = self
            .inner
            .dialers
            .lock()
            .expect("node lock poisoned")
            .iter()
            .map(|dialer| dialer.proto().to_string())
            .collect();
        let urls: Vec<String> = peer
            .eligible_urls(&protos)
            .into_iter()
            .map(str::to_owned)
            .collect();

        let mut last_err = Error::NotFound(to.to_hex());
        for url in urls {
            match self.connect(&url).await {
                Ok(address) if address == *to => {
                    if let Some(connection) = self.connection(to) {
                        return Ok(connection);
                    }
                }
                Ok(other) => {
                    debug!(url = %url, expected = %to, got = %other, "url resolved to a different peer");
                }
                Err(err) => {
                    debug!(url = %url, %err, "dial failed");
                    last_err = err;
                }
            }
        }
        // Every advertised URL failed; the entry is stale.
        self.inner.registry.invalidate(to);
        Err(last_err)
    }

    /// Sends a copy of the command to every connected peer, each sealed for
    /// its recipient. Per-peer failures are logged, not propagated.
    pub async fn broadcast(&self, command: &str, payload: Vec<u8>) -> Result<()> {
        self.broadcast_except(command, payload, &[]).await
    }

    /// Like [`broadcast`](Self::broadcast), skipping the given addresses.
    pub async fn broadcast_except(
        &self,
        command: &str,
        payload: Vec<u8>,
        exclude: &[Address],
    ) -> Result<()> {
        self.ensure_running()?;
        for connection in self.snapshot_connections() {
            let peer_address = connection.peer().address();
            if exclude.contains(&peer_address) {
                continue;
            }
            let mut message = Message::new(command)
                .with_to(peer_address)
                .with_payload(payload.clone());
            message.from = Some(self.address());
            if let Err(err) = message.encrypt(connection.peer().identity()) {
                warn!(peer = %peer_address, %err, "could not encrypt broadcast copy");
                continue;
            }
            if let Err(err) = message.sign(&self.inner.identity) {
                warn!(peer = %peer_address, %err, "could not sign broadcast copy");
                continue;
            }
            if let Err(err) = connection.write(message).await {
                debug!(peer = %peer_address, %err, "broadcast write failed");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------

    /// Sends to a peer with no direct connection by flooding a sealed
    /// envelope through the overlay, at most [`RELAY_TTL`] hops.
    ///
    /// The destination's identity must be resolvable through the registry,
    /// since the payload is sealed for it end to end.
    pub async fn relay(&self, to: Address, command: &str, payload: Vec<u8>) -> Result<()> {
        self.relay_with_ttl(to, command, payload, RELAY_TTL).await
    }

    /// Like [`relay`](Self::relay) with an explicit hop budget. Every node
    /// that processes the envelope decrements the budget; an envelope
    /// arriving at zero is dropped silently, so a budget smaller than the
    /// path length never delivers.
    pub async fn relay_with_ttl(
        &self,
        to: Address,
        command: &str,
        payload: Vec<u8>,
        ttl: u8,
    ) -> Result<()> {
        self.ensure_running()?;
        if to == self.address() {
            return Err(Error::State("cannot relay to self"));
        }
        let advertisement = self.inner.registry.find(&to, FindOptions::default()).await?;
        let destination = Peer::from_advertisement(&advertisement)?;

        let mut inner = Message::new(command).with_to(to).with_payload(payload);
        inner.from = Some(self.address());
        inner.encrypt(destination.identity())?;
        inner.sign(&self.inner.identity)?;

        let mut envelope = Message::plain(COMMAND_RELAY)
            .with_to(to)
            .with_ttl(ttl)
            .with_payload(inner.encode()?);
        envelope.from = Some(self.address());

        self.flood_envelope(envelope, None).await;
        Ok(())
    }

    async fn flood_envelope(&self, envelope: Message, via: Option<Address>) {
        for connection in self.snapshot_connections() {
            let peer_address = connection.peer().address();
            if Some(peer_address) == via || Some(peer_address) == envelope.from {
                continue;
            }
            if let Err(err) = connection.write(envelope.clone()).await {
                debug!(peer = %peer_address, %err, "relay write failed");
            }
        }
    }

    async fn handle_relay(&self, via: Address, mut envelope: Message) {
        if envelope.ttl == 0 {
            return;
        }
        envelope.ttl -= 1;

        let inner = match Message::decode(&envelope.payload) {
            Ok(inner) => inner,
            Err(err) => {
                warn!(via = %via, %err, "malformed relay envelope");
                return;
            }
        };
        if inner.from == Some(self.address()) {
            // Our own flood echoed back.
            return;
        }
        if inner.signature.len() < 8 {
            warn!(via = %via, "unsigned relay payload");
            return;
        }
        let mut key_sig = [0u8; 8];
        key_sig.copy_from_slice(&inner.signature[..8]);
        let key: RelayKey = (inner.from, inner.to, key_sig);
        {
            let mut seen = self.inner.relay_seen.lock().expect("node lock poisoned");
            if seen.put(key, ()).is_some() {
                return;
            }
        }

        let Some(destination) = envelope.to else {
            warn!(via = %via, "relay envelope without destination");
            return;
        };

        if destination == self.address() {
            // Unwrapping needs a registry find for the origin's identity,
            // which can itself require dispatch to make progress, so it
            // runs off the dispatch task and re-injects the result.
            let node = self.clone();
            let remaining_ttl = envelope.ttl;
            tokio::spawn(async move {
                node.unwrap_relay(inner, remaining_ttl).await;
            });
        } else if let Some(connection) = self.connection(&destination) {
            if let Err(err) = connection.write(envelope).await {
                debug!(peer = %destination, %err, "relay forward failed");
            }
        } else {
            self.flood_envelope(envelope, Some(via)).await;
        }
    }

    /// Terminal relay step: resolve the origin, verify, decrypt, deliver.
    async fn unwrap_relay(&self, mut inner: Message, remaining_ttl: u8) {
        let Some(origin) = inner.from else {
            warn!("relayed message without origin");
            return;
        };
        let advertisement = match self
            .inner
            .registry
            .find(&origin, FindOptions::default())
            .await
        {
            Ok(advertisement) => advertisement,
            Err(err) => {
                warn!(origin = %origin, %err, "cannot resolve relay origin, dropping");
                return;
            }
        };
        let origin_peer = match Peer::from_advertisement(&advertisement) {
            Ok(peer) => peer,
            Err(err) => {
                warn!(origin = %origin, %err, "inauthentic relay origin, dropping");
                return;
            }
        };
        if let Err(err) = inner.verify(origin_peer.identity()) {
            warn!(origin = %origin, %err, "relayed message failed verification");
            return;
        }
        if let Err(err) = inner.decrypt(&self.inner.identity) {
            warn!(origin = %origin, %err, "relayed message failed decryption");
            return;
        }
        inner.ttl = remaining_ttl;
        let _ = self.inner.inbound_tx.send(Inbound::Delivery(inner)).await;
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn process_frame(&self, from: Address, message: Message) {
        if message.command == COMMAND_RELAY {
            self.handle_relay(from, message).await;
        } else {
            self.deliver(message).await;
        }
    }

    async fn deliver(&self, message: Message) {
        let handler = self
            .inner
            .handlers
            .lock()
            .expect("node lock poisoned")
            .iter()
            .find(|entry| entry.pattern.matches(&message.command))
            .cloned();
        match handler {
            Some(handler) => (handler.callback)(self.clone(), message).await,
            None => {
                // Unhandled commands fall through to the generic
                // subscriber, best effort.
                if self.inner.subscriber_tx.try_send(message).is_err() {
                    debug!("unhandled message with no active subscriber");
                }
            }
        }
    }
}

async fn run_dispatch(node: Node, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Frame { from, message } => node.process_frame(from, message).await,
            Inbound::Delivery(message) => node.deliver(message).await,
            Inbound::Closed { address, id } => node.remove_connection(&address, id),
        }
    }
}

async fn run_acceptor(node: Node, mut accepted: mpsc::Receiver<BoxedByteStream>) {
    while let Some(stream) = accepted.recv().await {
        let node = node.clone();
        tokio::spawn(async move {
            let outcome = Connection::establish(
                stream,
                Arc::clone(&node.inner.identity),
                node.advertisement(),
                HandshakeRole::Responder,
                node.inner.inbound_tx.clone(),
            )
            .await;
            match outcome {
                Ok(connection) => {
                    if let Err(err) = node.register_connection(connection) {
                        debug!(%err, "inbound connection discarded");
                    }
                }
                Err(err) => debug!(%err, "inbound handshake failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryHub;

    fn node() -> Node {
        Node::new(Identity::generate(), "net1")
    }

    #[test]
    fn command_patterns_match_as_expected() {
        assert!(CommandPattern::Exact("ping".into()).matches("ping"));
        assert!(!CommandPattern::Exact("ping".into()).matches("ping2"));
        assert!(CommandPattern::Prefix("peerfinder.".into()).matches("peerfinder.req"));
        assert!(!CommandPattern::Prefix("peerfinder.".into()).matches("peerfinder"));
        let even = CommandPattern::Predicate(Box::new(|c| c.len() % 2 == 0));
        assert!(even.matches("ab"));
        assert!(!even.matches("abc"));
    }

    #[test]
    fn handlers_register_and_remove() {
        let node = node();
        let id = node.handle(CommandPattern::Exact("x".into()), |_, _| Box::pin(async {}));
        let other = node.handle(CommandPattern::Exact("y".into()), |_, _| Box::pin(async {}));
        assert_ne!(id, other);
        assert_eq!(node.inner.handlers.lock().unwrap().len(), 2);
        node.remove_handler(id);
        assert_eq!(node.inner.handlers.lock().unwrap().len(), 1);
        assert_eq!(node.inner.handlers.lock().unwrap()[0].id, other);
    }

    #[test]
    fn advertisement_collects_receiver_urls() {
        let node = node();
        let hub = MemoryHub::new();
        node.add_receiver(Arc::new(hub.receiver("a")));
        node.add_receiver(Arc::new(hub.receiver("b")));
        let advertisement = node.advertisement();
        assert_eq!(advertisement.urls, ["memory:a", "memory:b"]);
        assert_eq!(advertisement.network_id, "net1");
        assert_eq!(advertisement.address, node.address().to_hex());
    }

    #[tokio::test]
    async fn stopped_node_refuses_traffic() {
        let node = node();
        let other = Identity::generate();
        assert!(matches!(
            node.send(other.address(), "ping", b"x".to_vec()).await,
            Err(Error::State(_))
        ));
        assert!(matches!(
            node.broadcast("ping", b"x".to_vec()).await,
            Err(Error::State(_))
        ));
        assert!(matches!(
            node.connect("memory:nowhere").await,
            Err(Error::State(_))
        ));
    }

    #[tokio::test]
    async fn node_starts_once_and_never_restarts() {
        let node = node();
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(Error::State(_))));
        node.stop().await;
        assert!(matches!(node.start().await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn messages_subscription_is_take_once() {
        let node = node();
        assert!(node.messages().await.is_some());
        assert!(node.messages().await.is_none());
    }

    #[tokio::test]
    async fn failed_start_leaves_no_tasks_behind() {
        struct BrokenReceiver;

        #[async_trait::async_trait]
        impl Receiver for BrokenReceiver {
            fn proto(&self) -> &str {
                "broken"
            }

            fn urls(&self) -> Vec<String> {
                vec!["broken:nowhere".into()]
            }

            async fn up(&self, _incoming: mpsc::Sender<BoxedByteStream>) -> Result<()> {
                Err(Error::State("receiver refuses to come up"))
            }

            async fn down(&self) {}
        }

        let node = node();
        node.add_receiver(Arc::new(BrokenReceiver));

        assert!(matches!(node.start().await, Err(Error::State(_))));
        // Tasks spawned before the failure were aborted, not kept.
        assert!(node.inner.tasks.lock().unwrap().is_empty());
        assert!(!node.inner.running.load(Ordering::SeqCst));
        let other = Identity::generate();
        assert!(matches!(
            node.send(other.address(), "ping", b"x".to_vec()).await,
            Err(Error::State(_))
        ));
    }
}
