//! Torrent health estimation from BEP33 DHT scrapes.
//!
//! Given an info hash, [`HealthManager`] asks the host DHT engine to run a `get_peers` lookup,
//! collects the `BFsd`/`BFpe` bloom filters from every response received within a time window,
//! combines them and estimates the number of seeders and leechers of the torrent.
//!
//! The DHT engine itself is not part of this crate. It is plugged in through [`DhtEngine`] (to
//! start lookups) and [`HealthHooks`] (to report the queries it sends and the scrape responses it
//! receives, through [`HealthManager::hooks`]). An engine that talks to the network through a [`SocketTrait`] can be run on top of
//! a [`ScrapeSocket`], which calls the hooks on its behalf.

pub mod bloom;
pub mod message;

mod adapter;
mod handler;
mod info_hash;
mod lookup;
mod manager;
mod registry;
mod socket;
mod timer;

pub use crate::adapter::{DhtEngine, HealthHooks};
pub use crate::bloom::{BloomFilter, FilterSizeError, BLOOM_FILTER_LEN, MAX_ESTIMATE};
pub use crate::handler::DebugState;
pub use crate::info_hash::{InfoHash, LengthError, NodeId, INFO_HASH_LEN};
pub use crate::lookup::HealthInfo;
pub use crate::manager::{
    HealthError, HealthHooksHandle, HealthLookup, HealthManager, HealthManagerBuilder,
    DEFAULT_TIMEOUT,
};
pub use crate::socket::{ScrapeSocket, SocketTrait};
