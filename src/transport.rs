//! Transport abstraction: dialers produce byte streams, receivers accept
//! them.
//!
//! The overlay only requires an ordered, reliable, bidirectional byte
//! stream; framing, authentication, and encryption all happen above in the
//! connection layer. A transport is addressed by URL, where everything up to
//! the first `:` names the scheme a [`Dialer`] claims via
//! [`Dialer::proto`].
//!
//! The built-in memory transport wires nodes together inside one process
//! through a shared [`MemoryHub`], with URLs of the form `memory:<name>`.
//! It exists for tests and examples, but it exercises exactly the same
//! connection machinery as a network transport would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Buffer size of an in-memory duplex stream, per direction.
const MEMORY_STREAM_CAPACITY: usize = 64 * 1024;

/// What a connection needs from a transport: ordered reliable bytes, both
/// directions, movable across tasks.
pub trait ByteStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

impl std::fmt::Debug for dyn ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ByteStream")
    }
}

pub type BoxedByteStream = Box<dyn ByteStream>;

/// Outbound half of a transport: turns a URL of its scheme into a live
/// stream.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Scheme token this dialer handles, without the trailing `:`.
    fn proto(&self) -> &str;

    async fn dial(&self, url: &str) -> Result<BoxedByteStream>;
}

/// Inbound half of a transport: binds somewhere dialable and hands accepted
/// streams to the node.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Scheme token this receiver serves, without the trailing `:`.
    fn proto(&self) -> &str;

    /// URLs remote peers can dial to reach this receiver. These end up in
    /// the owning node's advertisement.
    fn urls(&self) -> Vec<String>;

    /// Starts accepting. Each accepted stream is pushed into `incoming`;
    /// the node runs the responder handshake on it.
    async fn up(&self, incoming: mpsc::Sender<BoxedByteStream>) -> Result<()>;

    /// Stops accepting. Established connections are unaffected.
    async fn down(&self);
}

// ============================================================================
// Memory transport
// ============================================================================

/// In-process switchboard connecting memory dialers to memory receivers.
///
/// Nodes that should reach each other share one hub. Cloning is cheap; all
/// clones see the same bindings.
#[derive(Clone, Default)]
pub struct MemoryHub {
    bindings: Arc<Mutex<HashMap<String, mpsc::Sender<BoxedByteStream>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> MemoryDialer {
        MemoryDialer { hub: self.clone() }
    }

    pub fn receiver(&self, name: impl Into<String>) -> MemoryReceiver {
        MemoryReceiver {
            hub: self.clone(),
            name: name.into(),
        }
    }

    async fn connect(&self, name: &str) -> Result<BoxedByteStream> {
        let accept = self
            .bindings
            .lock()
            .expect("memory hub lock poisoned")
            .get(name)
            .cloned();
        let Some(accept) = accept else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no memory receiver bound as {name:?}"),
            )));
        };
        let (local, remote) = tokio::io::duplex(MEMORY_STREAM_CAPACITY);
        accept.send(Box::new(remote)).await.map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("memory receiver {name:?} went down"),
            ))
        })?;
        Ok(Box::new(local))
    }

    fn bind(&self, name: &str, accept: mpsc::Sender<BoxedByteStream>) {
        self.bindings
            .lock()
            .expect("memory hub lock poisoned")
            .insert(name.to_string(), accept);
    }

    fn unbind(&self, name: &str) {
        self.bindings
            .lock()
            .expect("memory hub lock poisoned")
            .remove(name);
    }
}

pub struct MemoryDialer {
    hub: MemoryHub,
}

#[async_trait]
impl Dialer for MemoryDialer {
    fn proto(&self) -> &str {
        "memory"
    }

    async fn dial(&self, url: &str) -> Result<BoxedByteStream> {
        let name = url
            .strip_prefix("memory:")
            .ok_or_else(|| Error::Protocol(format!("not a memory url: {url:?}")))?;
        self.hub.connect(name).await
    }
}

pub struct MemoryReceiver {
    hub: MemoryHub,
    name: String,
}

#[async_trait]
impl Receiver for MemoryReceiver {
    fn proto(&self) -> &str {
        "memory"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("memory:{}", self.name)]
    }

    async fn up(&self, incoming: mpsc::Sender<BoxedByteStream>) -> Result<()> {
        self.hub.bind(&self.name, incoming);
        Ok(())
    }

    async fn down(&self) {
        self.hub.unbind(&self.name);
    }
}
