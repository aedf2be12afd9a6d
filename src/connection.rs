//! Connections: framing, the mutual-authentication handshake, and the
//! verified message pipeline.
//!
//! A [`Connection`] owns exactly one byte stream and moves through
//! Idle → Handshaking → Established → Closed. Closed is terminal; retries
//! mean a new connection. Frames are length-prefixed (u32 big-endian) with a
//! hard size bound, so transports only need to be ordered and reliable, not
//! message-oriented.
//!
//! ## Handshake
//!
//! Three messages, carried over the same framing as application traffic:
//!
//! 1. I→R `"handshake"`, SIGNED, payload = I's advertisement.
//! 2. R validates the advertisement (address must equal the hash of the
//!    public key, network ids must match), verifies the signature, then
//!    replies `"handshake-ack"` SIGNED+ENCRYPTED-to-I carrying R's own
//!    advertisement and a fresh random nonce.
//! 3. I decrypts, validates R the same way, verifies R's signature over the
//!    ciphertext, and replies `"handshake-ack2"` SIGNED+ENCRYPTED echoing
//!    the nonce. I is done at this point, since R's identity was already
//!    signature-verified; R completes once the echoed nonce matches.
//!
//! Completing steps 2–3 requires the private keys on both ends, and the
//! nonce check defeats replay of an old transcript. Any parse error, bad
//! signature, address/pubkey mismatch, or nonce mismatch aborts the
//! handshake and tears the connection down; no partial state survives.
//!
//! There is no built-in handshake timeout. A stalled handshake blocks only
//! its caller, who is expected to impose a deadline.
//!
//! ## Established phase
//!
//! A reader task decodes each frame, verifies the signature against the now
//! known peer identity and decrypts with the node's own identity, dropping
//! (with a warning) any frame that fails either check; unverified payloads
//! are never delivered. Malformed frames are fatal to the connection. A
//! writer task accepts already-typed wire messages; past the handshake
//! boundary the connection is a framing and verification pipe, it does not
//! decide routing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AuthError, Error, Result};
use crate::identity::Identity;
use crate::message::{Message, MODE_SECURE, MODE_SIGNED};
use crate::node::Inbound;
use crate::peer::{Advertisement, Peer};
use crate::transport::BoxedByteStream;

pub(crate) const COMMAND_HANDSHAKE: &str = "handshake";
pub(crate) const COMMAND_HANDSHAKE_ACK: &str = "handshake-ack";
pub(crate) const COMMAND_HANDSHAKE_ACK2: &str = "handshake-ack2";

/// Upper bound on a single frame. Prevents a hostile peer from forcing an
/// unbounded allocation out of a 4-byte length prefix.
pub(crate) const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Outbound messages buffered per connection before writes apply
/// backpressure to the caller.
const OUTBOUND_BUFFER: usize = 32;

const NONCE_LEN: usize = 16;

/// Which side of the handshake this connection plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeRole {
    /// Dialed the stream; speaks first.
    Initiator,
    /// Accepted the stream; answers with the nonce challenge.
    Responder,
}

/// `handshake-ack` payload: the responder introduces itself and issues the
/// replay-defeating challenge.
#[derive(Serialize, Deserialize)]
struct AckPayload {
    advertisement: Advertisement,
    nonce: String,
}

/// `handshake-ack2` payload: the initiator echoes the challenge.
#[derive(Serialize, Deserialize)]
struct AckEchoPayload {
    nonce: String,
}

// ============================================================================
// Frame I/O
// ============================================================================

pub(crate) async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_LEN as usize {
        return Err(Error::Protocol(format!("frame too large: {} bytes", frame.len())));
    }
    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame length {len} exceeds bound")));
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

// ============================================================================
// Connection
// ============================================================================

/// Process-unique connection ids. Teardown events carry the id so a stale
/// event for a discarded connection can never evict its replacement.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// An established, mutually authenticated connection to one peer.
pub struct Connection {
    id: u64,
    peer: Peer,
    outbound: mpsc::Sender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Runs the handshake on a fresh stream and, on success, spawns the
    /// reader/writer tasks. On any handshake failure the stream is shut
    /// down and nothing survives.
    pub(crate) async fn establish(
        mut stream: BoxedByteStream,
        identity: Arc<Identity>,
        advertisement: Advertisement,
        role: HandshakeRole,
        events: mpsc::Sender<Inbound>,
    ) -> Result<Self> {
        let handshake = match role {
            HandshakeRole::Initiator => {
                handshake_initiate(&mut stream, &identity, &advertisement).await
            }
            HandshakeRole::Responder => {
                handshake_respond(&mut stream, &identity, &advertisement).await
            }
        };
        let peer = match handshake {
            Ok(peer) => peer,
            Err(err) => {
                let _ = stream.shutdown().await;
                return Err(err);
            }
        };
        debug!(peer = %peer.address(), ?role, "handshake complete");

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

        let reader = tokio::spawn(run_reader(
            id,
            read_half,
            identity,
            peer.identity().clone(),
            events,
        ));
        let writer = tokio::spawn(run_writer(write_half, outbound_rx));

        Ok(Self {
            id,
            peer,
            outbound,
            tasks: vec![reader, writer],
        })
    }

    /// Process-unique id of this connection instance.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The authenticated remote peer.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Queues one already-typed wire message. The caller is responsible for
    /// having signed/encrypted it; half-built messages are rejected by the
    /// writer at encode time.
    pub(crate) async fn write(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::State("connection is closed"))
    }

    /// Tears the connection down. Terminal.
    pub(crate) fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_reader(
    id: u64,
    mut read_half: ReadHalf<BoxedByteStream>,
    own: Arc<Identity>,
    peer: Identity,
    events: mpsc::Sender<Inbound>,
) {
    let peer_address = peer.address();
    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(peer = %peer_address, "connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(peer = %peer_address, %err, "connection read failed");
                break;
            }
        };

        let mut message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(err) => {
                // Malformed framing is fatal: the stream can no longer be
                // trusted to stay in sync.
                warn!(peer = %peer_address, %err, "malformed frame, closing connection");
                break;
            }
        };

        if let Err(err) = message.verify(&peer) {
            warn!(peer = %peer_address, %err, "dropping frame that failed verification");
            continue;
        }
        if message.is_encrypted() {
            if let Err(err) = message.decrypt(&own) {
                warn!(peer = %peer_address, %err, "dropping frame that failed decryption");
                continue;
            }
        }

        if events
            .send(Inbound::Frame {
                from: peer_address,
                message,
            })
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = events
        .send(Inbound::Closed {
            address: peer_address,
            id,
        })
        .await;
}

async fn run_writer(mut write_half: WriteHalf<BoxedByteStream>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, command = %message.command, "refusing to write half-built message");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut write_half, &frame).await {
            debug!(%err, "connection write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

// ============================================================================
// Handshake
// ============================================================================

async fn handshake_initiate(
    stream: &mut BoxedByteStream,
    identity: &Identity,
    advertisement: &Advertisement,
) -> Result<Peer> {
    let mut hello = Message::new(COMMAND_HANDSHAKE)
        .with_mode(MODE_SIGNED)
        .with_payload(serde_json::to_vec(advertisement)?);
    hello.from = Some(identity.address());
    hello.sign(identity)?;
    write_frame(stream, &hello.encode()?).await?;

    let ack = Message::decode(&read_frame(stream).await?)?;
    if ack.command != COMMAND_HANDSHAKE_ACK {
        return Err(Error::Protocol(format!(
            "unexpected handshake reply: {:?}",
            ack.command
        )));
    }
    if ack.mode != MODE_SECURE {
        return Err(Error::Protocol("handshake-ack must be signed and encrypted".into()));
    }

    // The responder's identity travels inside the sealed payload; decrypt
    // first, then validate and verify its signature over the ciphertext.
    let plaintext = identity.decrypt(&ack.encrypted)?;
    let payload: AckPayload = serde_json::from_slice(&plaintext)?;
    let peer = Peer::from_advertisement(&payload.advertisement)?;
    if peer.network_id() != advertisement.network_id {
        return Err(AuthError::NetworkMismatch.into());
    }
    if ack.from != Some(peer.address()) {
        return Err(AuthError::AddressMismatch.into());
    }
    ack.verify(peer.identity())?;

    let mut echo = Message::new(COMMAND_HANDSHAKE_ACK2)
        .with_to(peer.address())
        .with_payload(serde_json::to_vec(&AckEchoPayload {
            nonce: payload.nonce,
        })?);
    echo.from = Some(identity.address());
    echo.encrypt(peer.identity())?;
    echo.sign(identity)?;
    write_frame(stream, &echo.encode()?).await?;

    // The responder's identity was signature-verified above; no fourth
    // message is needed on this side.
    Ok(peer)
}

async fn handshake_respond(
    stream: &mut BoxedByteStream,
    identity: &Identity,
    advertisement: &Advertisement,
) -> Result<Peer> {
    let hello = Message::decode(&read_frame(stream).await?)?;
    if hello.command != COMMAND_HANDSHAKE {
        return Err(Error::Protocol(format!(
            "expected handshake, got {:?}",
            hello.command
        )));
    }
    if hello.mode != MODE_SIGNED {
        return Err(Error::Protocol("handshake must be signed plaintext".into()));
    }

    let remote: Advertisement = serde_json::from_slice(&hello.payload)?;
    let peer = Peer::from_advertisement(&remote)?;
    if peer.network_id() != advertisement.network_id {
        return Err(AuthError::NetworkMismatch.into());
    }
    if hello.from != Some(peer.address()) {
        return Err(AuthError::AddressMismatch.into());
    }
    hello.verify(peer.identity())?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = hex::encode(nonce_bytes);

    let mut ack = Message::new(COMMAND_HANDSHAKE_ACK)
        .with_to(peer.address())
        .with_payload(serde_json::to_vec(&AckPayload {
            advertisement: advertisement.clone(),
            nonce: nonce.clone(),
        })?);
    ack.from = Some(identity.address());
    ack.encrypt(peer.identity())?;
    ack.sign(identity)?;
    write_frame(stream, &ack.encode()?).await?;

    let echo = Message::decode(&read_frame(stream).await?)?;
    if echo.command != COMMAND_HANDSHAKE_ACK2 {
        return Err(Error::Protocol(format!(
            "expected handshake-ack2, got {:?}",
            echo.command
        )));
    }
    if echo.mode != MODE_SECURE {
        return Err(Error::Protocol("handshake-ack2 must be signed and encrypted".into()));
    }
    echo.verify(peer.identity())?;
    let plaintext = identity.decrypt(&echo.encrypted)?;
    let payload: AckEchoPayload = serde_json::from_slice(&plaintext)?;
    if payload.nonce != nonce {
        return Err(AuthError::NonceMismatch.into());
    }

    Ok(peer)
}
