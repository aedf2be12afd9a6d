//! The registry: an advertisement cache in front of racing finders.
//!
//! [`Registry::find`] answers "how do I reach this address" in two steps:
//! cache first, then every attached [`Finder`] queried concurrently. The
//! first authentic advertisement for the right address and network wins and
//! is cached before it is returned; slower finders keep running to
//! completion but their answers go nowhere. Two failure shapes are kept
//! distinct so callers can tell them apart: every finder reported without a
//! match ([`Error::NotFound`]) versus the deadline elapsed first
//! ([`Error::Timeout`]).
//!
//! Cached entries never expire on a timer. They are replaced by fresher
//! finds and removed by [`Registry::invalidate`], which callers use when a
//! cached URL turns out to be dead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::finder::Finder;
use crate::identity::Address;
use crate::node::Node;
use crate::peer::{Advertisement, Peer};

/// Default deadline for one [`Registry::find`] call.
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(3);

/// Knobs for a single find.
#[derive(Clone, Debug)]
pub struct FindOptions {
    pub timeout: Duration,
    /// When false, the cache is bypassed (but a successful result is still
    /// written back).
    pub use_cache: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FIND_TIMEOUT,
            use_cache: true,
        }
    }
}

pub struct Registry {
    network_id: String,
    cache: Mutex<HashMap<Address, Advertisement>>,
    finders: Mutex<Vec<Arc<dyn Finder>>>,
}

impl Registry {
    pub(crate) fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            cache: Mutex::new(HashMap::new()),
            finders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_finder(&self, finder: Arc<dyn Finder>) {
        self.finders.lock().expect("registry lock poisoned").push(finder);
    }

    /// Brings every finder up. Called once by the owning node on start.
    pub(crate) async fn up(&self, node: &Node) -> Result<()> {
        let finders = self.snapshot_finders();
        for finder in finders {
            finder.up(node).await?;
        }
        Ok(())
    }

    pub(crate) async fn down(&self) {
        let finders = self.snapshot_finders();
        for finder in finders {
            finder.down().await;
        }
    }

    /// Cache lookup only; never touches the network.
    pub fn get(&self, address: &Address) -> Option<Advertisement> {
        self.cache
            .lock()
            .expect("registry lock poisoned")
            .get(address)
            .cloned()
    }

    /// Inserts an advertisement, replacing any cached one for the same
    /// address. The advertisement must be authentic: its address must equal
    /// the address derived from its public key.
    pub fn put(&self, advertisement: Advertisement) -> Result<()> {
        let peer = Peer::from_advertisement(&advertisement)?;
        self.cache
            .lock()
            .expect("registry lock poisoned")
            .insert(peer.address(), advertisement);
        Ok(())
    }

    /// Drops the cached entry, forcing the next find back to the finders.
    pub fn invalidate(&self, address: &Address) {
        self.cache
            .lock()
            .expect("registry lock poisoned")
            .remove(address);
    }

    /// Resolves an address to an advertisement: cache first, then all
    /// finders raced concurrently.
    pub async fn find(&self, address: &Address, options: FindOptions) -> Result<Advertisement> {
        if options.use_cache {
            if let Some(advertisement) = self.get(address) {
                return Ok(advertisement);
            }
        }

        let finders = self.snapshot_finders();
        if finders.is_empty() {
            return Err(Error::NotFound(address.to_hex()));
        }

        // Every finder runs as its own task; the race ends at the first
        // acceptable answer, at finder exhaustion, or at the deadline.
        // Losing finders are not cancelled.
        let (tx, mut rx) = mpsc::channel(finders.len());
        for finder in finders {
            let tx = tx.clone();
            let address = *address;
            tokio::spawn(async move {
                let outcome = finder.find(&address).await;
                let _ = tx.send((finder.name().to_string(), outcome)).await;
            });
        }
        drop(tx);

        let race = async {
            while let Some((name, outcome)) = rx.recv().await {
                match outcome {
                    Ok(Some(advertisement)) => {
                        if let Some(accepted) = self.accept(address, advertisement, &name) {
                            return Some(accepted);
                        }
                    }
                    Ok(None) => debug!(finder = %name, address = %address, "finder had no match"),
                    Err(err) => warn!(finder = %name, address = %address, %err, "finder failed"),
                }
            }
            None
        };

        match tokio::time::timeout(options.timeout, race).await {
            Ok(Some(advertisement)) => {
                self.put(advertisement.clone())?;
                Ok(advertisement)
            }
            Ok(None) => Err(Error::NotFound(address.to_hex())),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Screens one finder answer: authentic, for the queried address, on
    /// this network.
    fn accept(
        &self,
        address: &Address,
        advertisement: Advertisement,
        finder: &str,
    ) -> Option<Advertisement> {
        let peer = match Peer::from_advertisement(&advertisement) {
            Ok(peer) => peer,
            Err(err) => {
                warn!(finder, %err, "discarding inauthentic advertisement");
                return None;
            }
        };
        if peer.address() != *address {
            warn!(finder, address = %address, got = %peer.address(), "discarding advertisement for wrong address");
            return None;
        }
        if peer.network_id() != self.network_id {
            debug!(finder, network = peer.network_id(), "discarding advertisement from foreign network");
            return None;
        }
        Some(advertisement)
    }

    fn snapshot_finders(&self) -> Vec<Arc<dyn Finder>> {
        self.finders.lock().expect("registry lock poisoned").clone()
    }
}
