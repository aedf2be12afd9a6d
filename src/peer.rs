//! Peers and the advertisements that describe them.
//!
//! An [`Advertisement`] is the JSON document a node publishes about itself:
//! network id, address, public key, dialable URLs, and a freshness timestamp.
//! It travels in handshake payloads and finder responses.
//!
//! A [`Peer`] is only ever constructed by validating an advertisement: the
//! claimed address must equal the address recomputed from the claimed public
//! key. That check is the system's core authenticity invariant; everything
//! downstream (signature verification, sealed messaging) leans on it.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{AuthError, Error, Result};
use crate::identity::{Address, Identity};

/// Milliseconds since the Unix epoch, for freshness timestamps.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Self-description a node publishes: who it is and how to reach it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub network_id: String,
    /// Hex-rendered address, always recomputable from `pub_key`.
    pub address: String,
    /// Hex-encoded Ed25519 public key (32 bytes).
    pub pub_key: String,
    pub urls: Vec<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Advertisement {
    pub fn new(identity: &Identity, network_id: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            network_id: network_id.into(),
            address: identity.address().to_hex(),
            pub_key: hex::encode(identity.public_key_bytes()),
            urls,
            timestamp: now_ms(),
        }
    }
}

/// A validated remote identity with its reachability information.
#[derive(Clone, Debug)]
pub struct Peer {
    identity: Identity,
    network_id: String,
    urls: Vec<String>,
    last_seen: u64,
}

impl Peer {
    /// Validates an advertisement into a peer.
    ///
    /// Fails with an address-mismatch authentication error unless the
    /// advertised address equals the address derived from the advertised
    /// public key.
    pub fn from_advertisement(adv: &Advertisement) -> Result<Self> {
        let key = hex::decode(&adv.pub_key)
            .map_err(|_| Error::Protocol("advertisement pub_key is not valid hex".into()))?;
        let identity = Identity::from_public_key(&key)?;
        let claimed = Address::from_hex(&adv.address)?;
        if identity.address() != claimed {
            return Err(AuthError::AddressMismatch.into());
        }
        Ok(Self {
            identity,
            network_id: adv.network_id.clone(),
            urls: adv.urls.clone(),
            last_seen: adv.timestamp,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Refreshes urls and the freshness timestamp from a newer
    /// advertisement. The identity itself never changes.
    pub fn update(&mut self, adv: &Advertisement) -> Result<()> {
        let claimed = Address::from_hex(&adv.address)?;
        if claimed != self.address() {
            return Err(AuthError::AddressMismatch.into());
        }
        self.urls = adv.urls.clone();
        self.last_seen = adv.timestamp;
        Ok(())
    }

    /// URLs this peer can actually be dialed on, given the scheme tokens of
    /// the locally registered dialers.
    pub fn eligible_urls(&self, protos: &[String]) -> Vec<&str> {
        self.urls
            .iter()
            .filter(|url| {
                protos
                    .iter()
                    .any(|proto| url.starts_with(proto.as_str()) && url[proto.len()..].starts_with(':'))
            })
            .map(String::as_str)
            .collect()
    }

    /// Re-exports this peer as an advertisement (as held, not refreshed).
    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            network_id: self.network_id.clone(),
            address: self.address().to_hex(),
            pub_key: hex::encode(self.identity.public_key_bytes()),
            urls: self.urls.clone(),
            timestamp: self.last_seen,
        }
    }
}
