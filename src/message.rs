//! Wire-format messages and their cryptographic envelope.
//!
//! A [`Message`] is the unit of exchange between peers. On the wire it is a
//! fixed-size header followed by a variable trailer, carried inside
//! length-prefixed frames (the framing itself lives in the connection layer):
//!
//! ```text
//! 0        mode (1 byte)
//! 1        ttl (1 byte)
//! 2..12    from address (10 bytes, zero-filled if absent)
//! 12..22   to address (10 bytes, zero-filled if absent)
//! 22..86   signature (64 bytes, zero-filled if unsigned)
//! 86       command length N (1 byte)
//! 87..87+N command (UTF-8)
//! rest     payload (plaintext, or ciphertext when ENCRYPTED)
//! ```
//!
//! Mode is a bitset of [`MODE_ENCRYPTED`] and [`MODE_SIGNED`]. The plaintext
//! and ciphertext slots are mutually exclusive: encrypting moves the payload
//! into the encrypted slot, decrypting moves it back. The signature always
//! covers the bytes actually transmitted (ciphertext when encrypted), so a
//! relay or receiver can verify a signature without being able to decrypt.
//!
//! [`Message::encode`] rejects half-built messages: a SIGNED message without
//! a signature or an ENCRYPTED message without ciphertext is a bug in the
//! caller, caught here at the boundary.

use crate::error::{AuthError, Error, Result};
use crate::identity::{Address, Identity, ADDRESS_LEN};

/// No envelope: payload travels as-is.
pub const MODE_PLAIN: u8 = 0;
/// Payload is sealed for the destination address.
pub const MODE_ENCRYPTED: u8 = 1;
/// Wire payload is signed by the source address.
pub const MODE_SIGNED: u8 = 2;
/// Signed and encrypted; the default for application traffic.
pub const MODE_SECURE: u8 = MODE_ENCRYPTED | MODE_SIGNED;

/// Fixed Ed25519 signature width on the wire.
pub const SIGNATURE_LEN: usize = 64;

/// Commands are length-prefixed with a single byte.
pub const MAX_COMMAND_LEN: usize = 255;

const OFFSET_MODE: usize = 0;
const OFFSET_TTL: usize = 1;
const OFFSET_FROM: usize = 2;
const OFFSET_TO: usize = OFFSET_FROM + ADDRESS_LEN;
const OFFSET_SIGNATURE: usize = OFFSET_TO + ADDRESS_LEN;
const OFFSET_COMMAND_LEN: usize = OFFSET_SIGNATURE + SIGNATURE_LEN;

/// Header bytes before the command: mode + ttl + from + to + signature +
/// command length.
pub const HEADER_LEN: usize = OFFSET_COMMAND_LEN + 1;

#[derive(Clone, Debug)]
pub struct Message {
    pub mode: u8,
    pub ttl: u8,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub command: String,
    /// Plaintext slot. Empty while the message is encrypted.
    pub payload: Vec<u8>,
    /// Ciphertext slot. Empty unless the message is encrypted.
    pub encrypted: Vec<u8>,
    /// 64 bytes once signed, empty otherwise.
    pub signature: Vec<u8>,
}

impl Message {
    /// A new secure (signed + encrypted) message with ttl 1.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            mode: MODE_SECURE,
            ttl: 1,
            from: None,
            to: None,
            command: command.into(),
            payload: Vec::new(),
            encrypted: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// A new plain (unsigned, unencrypted) message with ttl 1.
    pub fn plain(command: impl Into<String>) -> Self {
        Self {
            mode: MODE_PLAIN,
            ..Self::new(command)
        }
    }

    pub fn with_mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.mode & MODE_ENCRYPTED != 0
    }

    pub fn is_signed(&self) -> bool {
        self.mode & MODE_SIGNED != 0
    }

    /// The bytes that travel in the frame trailer: ciphertext when the
    /// ENCRYPTED flag is set, plaintext otherwise. Signatures cover exactly
    /// these bytes.
    pub fn wire_payload(&self) -> &[u8] {
        if self.is_encrypted() {
            &self.encrypted
        } else {
            &self.payload
        }
    }

    /// Signs the wire payload. No-op without the SIGNED flag.
    ///
    /// The signer must own the message source: `identity.address == from`.
    /// Call after [`encrypt`](Self::encrypt) so the signature covers the
    /// transmitted ciphertext.
    pub fn sign(&mut self, identity: &Identity) -> Result<()> {
        if !self.is_signed() {
            return Ok(());
        }
        if self.from != Some(identity.address()) {
            return Err(Error::State("signing identity does not own the message source"));
        }
        let signature = identity.sign(self.wire_payload())?;
        self.signature = signature.to_vec();
        Ok(())
    }

    /// Verifies the signature over the wire payload against `identity`.
    /// No-op without the SIGNED flag. Never requires decryption.
    pub fn verify(&self, identity: &Identity) -> Result<()> {
        if !self.is_signed() {
            return Ok(());
        }
        if self.from != Some(identity.address()) {
            return Err(AuthError::AddressMismatch.into());
        }
        if identity.verify(self.wire_payload(), &self.signature) {
            Ok(())
        } else {
            Err(AuthError::BadSignature.into())
        }
    }

    /// Seals the payload for the recipient, moving it into the ciphertext
    /// slot. No-op without the ENCRYPTED flag.
    ///
    /// The recipient must own the message destination:
    /// `recipient.address == to`.
    pub fn encrypt(&mut self, recipient: &Identity) -> Result<()> {
        if !self.is_encrypted() {
            return Ok(());
        }
        if self.to != Some(recipient.address()) {
            return Err(Error::State(
                "encrypting identity does not own the message destination",
            ));
        }
        if self.payload.is_empty() {
            return Err(Error::State("cannot encrypt an empty payload"));
        }
        self.encrypted = recipient.encrypt(&self.payload)?;
        self.payload.clear();
        Ok(())
    }

    /// Opens the ciphertext slot back into the payload slot. No-op without
    /// the ENCRYPTED flag.
    pub fn decrypt(&mut self, identity: &Identity) -> Result<()> {
        if !self.is_encrypted() {
            return Ok(());
        }
        if self.to != Some(identity.address()) {
            return Err(Error::State(
                "decrypting identity does not own the message destination",
            ));
        }
        self.payload = identity.decrypt(&self.encrypted)?;
        self.encrypted.clear();
        Ok(())
    }

    /// Encodes the message into its wire layout.
    ///
    /// Fails on half-built messages: missing `from`, a SIGNED flag without a
    /// signature, or an ENCRYPTED flag without ciphertext.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let from = self.from.ok_or(Error::State("message from is required"))?;
        if self.is_signed() && self.signature.len() != SIGNATURE_LEN {
            return Err(Error::State("signed flag set but message is not signed"));
        }
        if self.is_encrypted() && self.encrypted.is_empty() {
            return Err(Error::State(
                "encrypted flag set but message is not encrypted",
            ));
        }
        let command = self.command.as_bytes();
        if command.len() > MAX_COMMAND_LEN {
            return Err(Error::Protocol(format!(
                "command too long: {} bytes",
                command.len()
            )));
        }

        let wire_payload = self.wire_payload();
        let mut buf = vec![0u8; HEADER_LEN + command.len() + wire_payload.len()];
        buf[OFFSET_MODE] = self.mode;
        buf[OFFSET_TTL] = self.ttl;
        buf[OFFSET_FROM..OFFSET_TO].copy_from_slice(from.as_bytes());
        if let Some(to) = self.to {
            buf[OFFSET_TO..OFFSET_SIGNATURE].copy_from_slice(to.as_bytes());
        }
        if self.is_signed() {
            buf[OFFSET_SIGNATURE..OFFSET_COMMAND_LEN].copy_from_slice(&self.signature);
        }
        buf[OFFSET_COMMAND_LEN] = command.len() as u8;
        buf[HEADER_LEN..HEADER_LEN + command.len()].copy_from_slice(command);
        buf[HEADER_LEN + command.len()..].copy_from_slice(wire_payload);
        Ok(buf)
    }

    /// Decodes one wire frame. The ENCRYPTED flag, not caller intent,
    /// decides whether the trailing bytes land in the payload or the
    /// ciphertext slot.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "short frame: {} bytes (header needs {HEADER_LEN})",
                frame.len()
            )));
        }
        let mode = frame[OFFSET_MODE];
        if mode & !MODE_SECURE != 0 {
            return Err(Error::Protocol(format!("unknown mode bits: {mode:#04x}")));
        }
        let ttl = frame[OFFSET_TTL];

        let mut addr = [0u8; ADDRESS_LEN];
        addr.copy_from_slice(&frame[OFFSET_FROM..OFFSET_TO]);
        let from = Address::from_wire(addr);
        addr.copy_from_slice(&frame[OFFSET_TO..OFFSET_SIGNATURE]);
        let to = Address::from_wire(addr);

        let signature_bytes = &frame[OFFSET_SIGNATURE..OFFSET_COMMAND_LEN];
        let signature = if signature_bytes.iter().all(|b| *b == 0) {
            Vec::new()
        } else {
            signature_bytes.to_vec()
        };

        let command_len = frame[OFFSET_COMMAND_LEN] as usize;
        if frame.len() < HEADER_LEN + command_len {
            return Err(Error::Protocol("command overruns frame".into()));
        }
        let command = std::str::from_utf8(&frame[HEADER_LEN..HEADER_LEN + command_len])
            .map_err(|_| Error::Protocol("command is not valid utf-8".into()))?
            .to_owned();

        let tail = frame[HEADER_LEN + command_len..].to_vec();
        let (payload, encrypted) = if mode & MODE_ENCRYPTED != 0 {
            (Vec::new(), tail)
        } else {
            (tail, Vec::new())
        };

        Ok(Self {
            mode,
            ttl,
            from,
            to,
            command,
            payload,
            encrypted,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_pair() -> (Identity, Identity) {
        (Identity::generate(), Identity::generate())
    }

    #[test]
    fn plain_message_round_trip() {
        let (alice, bob) = identity_pair();
        let mut m = Message::plain("ping")
            .with_to(bob.address())
            .with_payload("x")
            .with_ttl(3);
        m.from = Some(alice.address());

        let decoded = Message::decode(&m.encode().unwrap()).unwrap();
        assert_eq!(decoded.mode, MODE_PLAIN);
        assert_eq!(decoded.ttl, 3);
        assert_eq!(decoded.from, Some(alice.address()));
        assert_eq!(decoded.to, Some(bob.address()));
        assert_eq!(decoded.command, "ping");
        assert_eq!(decoded.payload, b"x");
        assert!(decoded.encrypted.is_empty());
        assert!(decoded.signature.is_empty());
    }

    #[test]
    fn absent_to_is_zero_filled_and_restored_as_none() {
        let (alice, _) = identity_pair();
        let mut m = Message::plain("announce").with_payload("hello");
        m.from = Some(alice.address());

        let frame = m.encode().unwrap();
        assert!(frame[12..22].iter().all(|b| *b == 0));
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.to, None);
    }

    #[test]
    fn secure_message_round_trip_bit_exact() {
        let (alice, bob) = identity_pair();
        let mut m = Message::new("data")
            .with_to(bob.address())
            .with_payload("payload bytes");
        m.from = Some(alice.address());
        m.encrypt(&bob).unwrap();
        m.sign(&alice).unwrap();

        let frame = m.encode().unwrap();
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.mode, MODE_SECURE);
        assert_eq!(decoded.signature, m.signature);
        assert_eq!(decoded.encrypted, m.encrypted);
        assert!(decoded.payload.is_empty());
        // Re-encoding reproduces the identical frame.
        assert_eq!(decoded.encode().unwrap(), frame);
    }

    #[test]
    fn signature_verifies_without_decryption() {
        let (alice, bob) = identity_pair();
        let mut m = Message::new("data")
            .with_to(bob.address())
            .with_payload("secret");
        m.from = Some(alice.address());
        m.encrypt(&bob).unwrap();
        m.sign(&alice).unwrap();

        let decoded = Message::decode(&m.encode().unwrap()).unwrap();
        // A third party holding only alice's public key can verify.
        let alice_pub = Identity::from_public_key(&alice.public_key_bytes()).unwrap();
        decoded.verify(&alice_pub).unwrap();

        // And the intended recipient can then decrypt.
        let mut decoded = decoded;
        decoded.decrypt(&bob).unwrap();
        assert_eq!(decoded.payload, b"secret");
        assert!(decoded.encrypted.is_empty());
    }

    #[test]
    fn verify_rejects_wrong_signer_and_tampered_payload() {
        let (alice, bob) = identity_pair();
        let mut m = Message::new("data")
            .with_mode(MODE_SIGNED)
            .with_payload("content");
        m.from = Some(alice.address());
        m.sign(&alice).unwrap();

        assert!(m.verify(&alice).is_ok());
        assert!(matches!(
            m.verify(&bob),
            Err(Error::Auth(AuthError::AddressMismatch))
        ));

        let mut tampered = m.clone();
        tampered.payload = b"contents".to_vec();
        assert!(matches!(
            tampered.verify(&alice),
            Err(Error::Auth(AuthError::BadSignature))
        ));
    }

    #[test]
    fn sign_requires_owning_the_source() {
        let (alice, bob) = identity_pair();
        let mut m = Message::new("data").with_payload("x");
        m.from = Some(alice.address());
        assert!(matches!(m.sign(&bob), Err(Error::State(_))));
    }

    #[test]
    fn encrypt_requires_owning_the_destination() {
        let (alice, bob) = identity_pair();
        let mut m = Message::new("data")
            .with_to(bob.address())
            .with_payload("x");
        m.from = Some(alice.address());
        assert!(matches!(m.encrypt(&alice), Err(Error::State(_))));
        assert!(m.encrypt(&bob).is_ok());
        assert!(matches!(m.decrypt(&alice), Err(Error::State(_))));
    }

    #[test]
    fn encode_rejects_half_built_messages() {
        let (alice, bob) = identity_pair();

        // Missing from.
        let m = Message::plain("c").with_payload("x");
        assert!(matches!(m.encode(), Err(Error::State(_))));

        // SIGNED without a signature.
        let mut m = Message::new("c")
            .with_mode(MODE_SIGNED)
            .with_payload("x");
        m.from = Some(alice.address());
        assert!(matches!(m.encode(), Err(Error::State(_))));

        // ENCRYPTED without ciphertext.
        let mut m = Message::new("c").with_to(bob.address()).with_payload("x");
        m.from = Some(alice.address());
        m.signature = vec![0xAA; SIGNATURE_LEN];
        assert!(matches!(m.encode(), Err(Error::State(_))));
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        // Too short.
        assert!(matches!(
            Message::decode(&[0u8; 10]),
            Err(Error::Protocol(_))
        ));

        let (alice, _) = identity_pair();
        let mut m = Message::plain("cmd").with_payload("data");
        m.from = Some(alice.address());
        let frame = m.encode().unwrap();

        // Unknown mode bits.
        let mut bad = frame.clone();
        bad[0] = 0x10;
        assert!(matches!(Message::decode(&bad), Err(Error::Protocol(_))));

        // Command length pointing past the end.
        let mut bad = frame.clone();
        bad[86] = 0xFF;
        assert!(matches!(Message::decode(&bad), Err(Error::Protocol(_))));

        // Invalid UTF-8 command.
        let mut bad = frame;
        bad[87] = 0xFF;
        assert!(matches!(Message::decode(&bad), Err(Error::Protocol(_))));
    }

    #[test]
    fn unsigned_flag_skips_envelope_operations() {
        let (alice, bob) = identity_pair();
        let mut m = Message::plain("c").with_payload("x");
        m.from = Some(alice.address());
        // Plain messages ignore sign/encrypt entirely.
        m.sign(&alice).unwrap();
        m.encrypt(&bob).unwrap();
        assert!(m.signature.is_empty());
        assert!(m.encrypted.is_empty());
    }
}
