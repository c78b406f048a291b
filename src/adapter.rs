//! Contract between the health manager and the DHT engine hosting it.
//!
//! The engine does the actual Kademlia work. The manager only asks it to start `get_peers`
//! lookups ([`DhtEngine`]) and is told about the queries the engine sends and the scrape
//! responses it receives ([`HealthHooks`]). Engines that send and receive raw datagrams can get
//! the hooks for free by running on top of a [`ScrapeSocket`](crate::ScrapeSocket).

use crate::{bloom::BloomFilter, info_hash::InfoHash};
use tokio::sync::mpsc;

/// The part of a DHT engine the health manager drives.
pub trait DhtEngine: Send + Sync {
    /// Start an iterative `get_peers` lookup for `info_hash`. Fire and forget: the outcome is
    /// reported only through [`HealthHooks`].
    fn start_get_peers(&self, info_hash: InfoHash);
}

impl<F> DhtEngine for F
where
    F: Fn(InfoHash) + Send + Sync,
{
    fn start_get_peers(&self, info_hash: InfoHash) {
        self(info_hash)
    }
}

/// Hand the info hash over to a task running the engine.
impl DhtEngine for mpsc::UnboundedSender<InfoHash> {
    fn start_get_peers(&self, info_hash: InfoHash) {
        if self.send(info_hash).is_err() {
            log::warn!("Failed to start get_peers for {:?} - engine has shut down", info_hash);
        }
    }
}

/// Events the DHT engine reports back. Implementations must not block.
pub trait HealthHooks: Send + Sync {
    /// A `get_peers` query for `info_hash` with transaction id `tid` is about to be sent. Must be
    /// called before the query hits the wire so that its response cannot overtake it.
    fn on_outgoing_query(&self, tid: &[u8], info_hash: InfoHash);

    /// A response with transaction id `tid` carrying BEP33 scrape filters was received. Each side
    /// is `None` when the field was missing or malformed.
    fn on_response(&self, tid: &[u8], seeders: Option<BloomFilter>, peers: Option<BloomFilter>);
}
