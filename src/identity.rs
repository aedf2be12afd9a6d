//! Identities and self-certifying addresses.
//!
//! Every participant is identified by an [`Address`] derived from an Ed25519
//! public key, so any peer can check a claimed identity without a directory
//! service: recompute the hash, compare the addresses.
//!
//! An [`Identity`] wraps the keypair and exposes the four capabilities the
//! protocol needs:
//!
//! - `sign` / `verify`: Ed25519 over arbitrary bytes
//! - `encrypt` / `decrypt`: sealed-box public-key encryption (ephemeral
//!   X25519 agreement + XChaCha20-Poly1305)
//!
//! `sign` and `decrypt` require the private half and fail with a state error
//! without it; `verify` never fails on malformed input, it returns `false`.
//!
//! ## Sealed box layout
//!
//! ```text
//! 0..32   ephemeral X25519 public key
//! 32..56  XChaCha20-Poly1305 nonce (24 bytes)
//! 56..    ciphertext + 16-byte Poly1305 tag
//! ```
//!
//! The symmetric key is `blake3::derive_key(context, shared || eph_pub ||
//! recipient_pub)`. The Ed25519 secret converts to X25519 by hashing the seed
//! with SHA-512 and taking the lower 32 bytes (RFC 7748 compatible); the
//! public key converts through its Montgomery form, so encrypting needs only
//! the recipient's Ed25519 public key.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use sha3::Sha3_256;

use crate::error::{AuthError, Error, Result};

/// Binary width of an address: the trailing bytes of SHA3-256 over the
/// public key. Rendered as 20 lowercase hex characters.
pub const ADDRESS_LEN: usize = 10;

/// Domain separation context for sealed-box key derivation.
const SEAL_CONTEXT: &str = "weft 2024 sealed box key v1";

const SEAL_EPHEMERAL_LEN: usize = 32;
const SEAL_NONCE_LEN: usize = 24;
const SEAL_TAG_LEN: usize = 16;

/// Minimum length of a sealed payload: ephemeral key + nonce + tag.
pub const SEAL_OVERHEAD: usize = SEAL_EPHEMERAL_LEN + SEAL_NONCE_LEN + SEAL_TAG_LEN;

// ============================================================================
// Address
// ============================================================================

/// Short self-certifying identifier for a peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Derives the address for an Ed25519 public key: the trailing
    /// [`ADDRESS_LEN`] bytes of `SHA3-256(public key)`.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha3_256::digest(public_key);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[digest.len() - ADDRESS_LEN..]);
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Reads an address out of a wire field. All-zero fields mean "absent".
    pub(crate) fn from_wire(bytes: [u8; ADDRESS_LEN]) -> Option<Self> {
        if bytes.iter().all(|b| *b == 0) {
            None
        } else {
            Some(Self(bytes))
        }
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::Protocol(format!("bad address hex: {s:?}")))?;
        if bytes.len() != ADDRESS_LEN {
            return Err(Error::Protocol(format!(
                "bad address length: {} (expected {ADDRESS_LEN})",
                bytes.len()
            )));
        }
        let mut arr = [0u8; ADDRESS_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

// ============================================================================
// Identity
// ============================================================================

/// An Ed25519 keypair with its derived address.
///
/// Holds at least the public half; the private half is present for identities
/// created with [`Identity::generate`] or [`Identity::from_secret_key`] and
/// absent for identities learned from the network.
#[derive(Clone)]
pub struct Identity {
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
    address: Address,
}

impl Identity {
    /// Generates a fresh keypair from OS entropy.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing(signing)
    }

    /// Builds a public-only identity from 32 raw Ed25519 public key bytes.
    pub fn from_public_key(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Auth(AuthError::InvalidKey))?;
        let verifying =
            VerifyingKey::from_bytes(&arr).map_err(|_| Error::Auth(AuthError::InvalidKey))?;
        let address = Address::from_public_key(verifying.as_bytes());
        Ok(Self {
            signing: None,
            verifying,
            address,
        })
    }

    /// Rebuilds a full identity from a 32-byte Ed25519 secret key.
    pub fn from_secret_key(bytes: &[u8; 32]) -> Self {
        Self::from_signing(SigningKey::from_bytes(bytes))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        let address = Address::from_public_key(verifying.as_bytes());
        Self {
            signing: Some(signing),
            verifying,
            address,
        }
    }

    /// The self-certifying address, always recomputed from the public key.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    pub fn secret_key_bytes(&self) -> Option<[u8; 32]> {
        self.signing.as_ref().map(|key| key.to_bytes())
    }

    /// Whether the private half is present.
    pub fn has_secret(&self) -> bool {
        self.signing.is_some()
    }

    /// Signs `data`, returning the 64-byte Ed25519 signature.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; 64]> {
        let signing = self
            .signing
            .as_ref()
            .ok_or(Error::State("signing requires the private key"))?;
        Ok(signing.sign(data).to_bytes())
    }

    /// Verifies `signature` over `data` against this identity's public key.
    ///
    /// Malformed signatures are not an error, they simply do not verify.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying.verify(data, &signature).is_ok()
    }

    /// Seals `plaintext` so only the holder of this identity's private key
    /// can open it. Needs only the public key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let recipient = x25519_dalek::PublicKey::from(self.verifying.to_montgomery().to_bytes());

        let ephemeral = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = x25519_dalek::PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);

        let key = seal_key(shared.as_bytes(), ephemeral_pub.as_bytes(), recipient.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

        let mut nonce = [0u8; SEAL_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Protocol("sealed-box encryption failed".into()))?;

        let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens a sealed payload with this identity's private key.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let signing = self
            .signing
            .as_ref()
            .ok_or(Error::State("decrypting requires the private key"))?;

        if sealed.len() < SEAL_OVERHEAD {
            return Err(AuthError::DecryptFailed.into());
        }

        let mut ephemeral_pub = [0u8; SEAL_EPHEMERAL_LEN];
        ephemeral_pub.copy_from_slice(&sealed[..SEAL_EPHEMERAL_LEN]);
        let nonce = &sealed[SEAL_EPHEMERAL_LEN..SEAL_EPHEMERAL_LEN + SEAL_NONCE_LEN];
        let ciphertext = &sealed[SEAL_EPHEMERAL_LEN + SEAL_NONCE_LEN..];

        let secret = ed25519_secret_to_x25519(signing);
        let recipient = x25519_dalek::PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(ephemeral_pub));

        let key = seal_key(shared.as_bytes(), &ephemeral_pub, recipient.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::DecryptFailed.into())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address.to_hex())
            .field("has_secret", &self.signing.is_some())
            .finish_non_exhaustive()
    }
}

/// Derives the sealed-box symmetric key, binding both parties' X25519
/// public keys into the derivation.
fn seal_key(shared: &[u8; 32], ephemeral_pub: &[u8; 32], recipient_pub: &[u8; 32]) -> [u8; 32] {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral_pub);
    material[64..].copy_from_slice(recipient_pub);
    blake3::derive_key(SEAL_CONTEXT, &material)
}

/// Ed25519 seed to X25519 static secret: lower 32 bytes of SHA-512(seed).
/// Clamping is performed internally by x25519-dalek.
fn ed25519_secret_to_x25519(signing: &SigningKey) -> x25519_dalek::StaticSecret {
    let hash = Sha512::digest(signing.to_bytes());
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash[..32]);
    x25519_dalek::StaticSecret::from(secret)
}
