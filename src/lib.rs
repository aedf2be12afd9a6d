//! # Weft - Peer-to-Peer Overlay Networking Library
//!
//! Weft builds a secure overlay network out of pluggable transports and
//! discovery sources:
//!
//! - **Identity**: Ed25519 keypairs; a node's address is derived from its
//!   public key, so addresses are self-certifying
//! - **Messages**: a compact binary envelope, signed and sealed end to end
//! - **Handshake**: three-way mutual authentication with a replay-defeating
//!   nonce challenge before any application traffic flows
//! - **Discovery**: a caching registry that races any number of finders
//! - **Relay**: loop-bounded flooding delivers sealed messages between
//!   nodes with no direct connection
//!
//! ## Architecture
//!
//! A [`Node`] funnels all inbound traffic through one dispatch task, so
//! command handlers run sequentially and never race each other. Transports
//! only provide ordered reliable byte streams; everything cryptographic
//! happens above them, which is what makes them pluggable.
//!
//! ## Security Model
//!
//! - An advertisement is only trusted once its address is recomputed from
//!   its public key; forged advertisements never enter the registry
//! - Signatures cover the transmitted bytes (ciphertext when sealed), so
//!   intermediaries can verify what they cannot read
//! - Relayed payloads are sealed for the destination; intermediate hops
//!   route them without access to the plaintext
//! - Frames and commands are length-bounded; a hostile peer cannot force
//!   unbounded allocations
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, addresses, signing and sealed boxes |
//! | `message` | Wire-format messages and their envelope |
//! | `connection` | Framing, handshake, per-connection tasks |
//! | `peer` | Advertisements and validated peers |
//! | `registry` | Advertisement cache racing the finders |
//! | `finder` | Discovery sources: memory directory, peer queries |
//! | `transport` | Dialer/Receiver traits and the memory transport |
//! | `error` | Crate-wide error taxonomy |

mod connection;
mod error;
mod finder;
mod identity;
mod message;
mod node;
mod peer;
mod registry;
mod transport;

pub use connection::Connection;
pub use error::{AuthError, Error, Result};
pub use finder::{Finder, MemoryDirectory, MemoryFinder, PeerFinder};
pub use identity::{Address, Identity, ADDRESS_LEN};
pub use message::{
    Message, HEADER_LEN, MAX_COMMAND_LEN, MODE_ENCRYPTED, MODE_PLAIN, MODE_SECURE, MODE_SIGNED,
    SIGNATURE_LEN,
};
pub use node::{CommandPattern, HandlerFuture, HandlerId, Node, RELAY_TTL};
pub use peer::{Advertisement, Peer};
pub use registry::{FindOptions, Registry, DEFAULT_FIND_TIMEOUT};
pub use transport::{
    BoxedByteStream, ByteStream, Dialer, MemoryDialer, MemoryHub, MemoryReceiver, Receiver,
};
