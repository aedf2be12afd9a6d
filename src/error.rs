//! Crate-wide error types.
//!
//! Failures fall into a small number of kinds with very different handling:
//!
//! | Kind | Meaning | Handling |
//! |------|---------|----------|
//! | [`Error::Protocol`] | malformed frame or payload | fatal to the producing connection |
//! | [`Error::Auth`] | cryptographic check failed | fatal in handshake, drop-frame after |
//! | [`Error::State`] | programmer error | surfaced immediately, never swallowed |
//! | [`Error::NotFound`] | discovery exhausted all finders | recoverable, caller may retry |
//! | [`Error::Timeout`] | discovery deadline elapsed | recoverable, caller may retry |
//! | [`Error::Io`] | transport I/O failure | fatal to the producing connection |

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Authentication failure detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// A signature did not verify against the expected identity.
    BadSignature,
    /// A claimed address does not match the address derived from the
    /// claimed public key.
    AddressMismatch,
    /// The remote peer advertised a different network id.
    NetworkMismatch,
    /// Ciphertext could not be opened with the available key.
    DecryptFailed,
    /// The handshake nonce echo did not match what was issued.
    NonceMismatch,
    /// Key material did not parse as a valid Ed25519 point.
    InvalidKey,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::BadSignature => write!(f, "signature verification failed"),
            AuthError::AddressMismatch => {
                write!(f, "address does not match the advertised public key")
            }
            AuthError::NetworkMismatch => write!(f, "network id mismatch"),
            AuthError::DecryptFailed => write!(f, "failed to decrypt ciphertext"),
            AuthError::NonceMismatch => write!(f, "handshake nonce mismatch"),
            AuthError::InvalidKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
pub enum Error {
    /// Malformed frame, advertisement, or length. Never auto-retried.
    Protocol(String),
    /// A cryptographic check failed.
    Auth(AuthError),
    /// The operation was invalid in the current state, e.g. signing without
    /// a private key or sending on a stopped node.
    State(&'static str),
    /// No finder produced an advertisement for the address.
    NotFound(String),
    /// The discovery deadline elapsed before any finder answered.
    Timeout,
    /// Transport I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(detail) => write!(f, "protocol error: {detail}"),
            Error::Auth(err) => write!(f, "authentication error: {err}"),
            Error::State(detail) => write!(f, "invalid state: {detail}"),
            Error::NotFound(address) => write!(f, "peer not found: {address}"),
            Error::Timeout => write!(f, "find timeout"),
            Error::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Auth(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        Error::Auth(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(format!("bad json payload: {err}"))
    }
}

impl Error {
    /// True for the recoverable discovery failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Timeout)
    }
}
