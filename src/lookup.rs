use crate::{bloom::BloomFilter, info_hash::InfoHash};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};

/// Estimated swarm population of a torrent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthInfo {
    pub info_hash: InfoHash,
    pub seeders: u32,
    pub leechers: u32,
}

impl HealthInfo {
    /// Estimate with no seeders and no leechers.
    pub fn empty(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            seeders: 0,
            leechers: 0,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("lookup already finalized")]
pub(crate) struct AlreadyFinalized;

/// Accumulated scrape filters of one health lookup.
pub(crate) struct LookupState {
    info_hash: InfoHash,
    deadline: Instant,
    seeders_filter: BloomFilter,
    peers_filter: BloomFilter,
    // Everyone waiting for the result. Resolved exactly once, on finalization.
    subscribers: Vec<oneshot::Sender<HealthInfo>>,
    finalized: bool,
}

impl LookupState {
    pub fn new(info_hash: InfoHash, deadline: Instant) -> Self {
        Self {
            info_hash,
            deadline,
            seeders_filter: BloomFilter::EMPTY,
            peers_filter: BloomFilter::EMPTY,
            subscribers: Vec::new(),
            finalized: false,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Register a new receiver of the result.
    ///
    /// The sender is dropped right away if the lookup is already finalized.
    pub fn subscribe(&mut self, tx: oneshot::Sender<HealthInfo>) {
        if !self.finalized {
            self.subscribers.push(tx);
        }
    }

    /// Fold the filters of one response into the accumulated ones.
    pub fn merge(
        &mut self,
        seeders: Option<BloomFilter>,
        peers: Option<BloomFilter>,
    ) -> Result<(), AlreadyFinalized> {
        if self.finalized {
            return Err(AlreadyFinalized);
        }

        if let Some(seeders) = seeders {
            self.seeders_filter = self.seeders_filter.combine(&seeders);
        }

        if let Some(peers) = peers {
            self.peers_filter = self.peers_filter.combine(&peers);
        }

        Ok(())
    }

    /// Compute the estimate and deliver it to all subscribers. Only the first call succeeds.
    pub fn finalize(&mut self) -> Result<HealthInfo, AlreadyFinalized> {
        if self.finalized {
            return Err(AlreadyFinalized);
        }

        self.finalized = true;

        let info = HealthInfo {
            info_hash: self.info_hash,
            seeders: self.seeders_filter.estimate(),
            leechers: self.peers_filter.estimate(),
        };

        for tx in self.subscribers.drain(..) {
            // The subscriber may have lost interest.
            tx.send(info).unwrap_or(())
        }

        Ok(info)
    }

    #[cfg(test)]
    pub fn filters(&self) -> (BloomFilter, BloomFilter) {
        (self.seeders_filter, self.peers_filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BLOOM_FILTER_LEN;

    fn state() -> LookupState {
        LookupState::new(InfoHash::sha1(b"foo"), Instant::now())
    }

    fn single_bit(byte: usize, mask: u8) -> BloomFilter {
        let mut bytes = [0u8; BLOOM_FILTER_LEN];
        bytes[byte] = mask;
        BloomFilter::from(bytes)
    }

    #[test]
    fn finalize_without_responses() {
        let mut state = state();
        let info = state.finalize().unwrap();

        assert_eq!(info, HealthInfo::empty(InfoHash::sha1(b"foo")));
        assert!(state.is_finalized());
    }

    #[test]
    fn finalize_only_once() {
        let mut state = state();

        assert!(state.finalize().is_ok());
        assert_eq!(state.finalize(), Err(AlreadyFinalized));
    }

    #[test]
    fn merge_after_finalize_fails() {
        let mut state = state();
        state.finalize().unwrap();

        assert_eq!(
            state.merge(Some(BloomFilter::from([0xff; BLOOM_FILTER_LEN])), None),
            Err(AlreadyFinalized)
        );
        assert_eq!(state.filters(), (BloomFilter::EMPTY, BloomFilter::EMPTY));
    }

    #[test]
    fn merge_accumulates_monotonically() {
        let mut state = state();
        let a = single_bit(0, 0x01);
        let b = single_bit(100, 0x80);

        state.merge(Some(a), None).unwrap();
        let (seeders, peers) = state.filters();
        assert_eq!(seeders, a);
        assert_eq!(peers, BloomFilter::EMPTY);

        state.merge(Some(b), Some(b)).unwrap();
        let (seeders, peers) = state.filters();
        assert!(a.is_subset_of(&seeders));
        assert!(b.is_subset_of(&seeders));
        assert_eq!(peers, b);

        // No-op merge.
        state.merge(None, None).unwrap();
        assert_eq!(state.filters(), (a | b, b));
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let mut once = state();
        let mut twice = state();
        let filter = single_bit(3, 0x11);

        once.merge(Some(filter), Some(filter)).unwrap();
        twice.merge(Some(filter), Some(filter)).unwrap();
        twice.merge(Some(filter), Some(filter)).unwrap();

        assert_eq!(once.finalize(), twice.finalize());
    }

    #[test]
    fn finalize_estimates_both_sides() {
        let mut state = state();
        state
            .merge(Some(BloomFilter::from([0xff; BLOOM_FILTER_LEN])), None)
            .unwrap();

        let info = state.finalize().unwrap();
        assert_eq!(info.seeders, 6000);
        assert_eq!(info.leechers, 0);
    }

    #[tokio::test]
    async fn finalize_resolves_every_subscriber() {
        let mut state = state();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let (tx3, rx3) = oneshot::channel();
        state.subscribe(tx1);
        state.subscribe(tx2);
        state.subscribe(tx3);
        drop(rx2);

        assert_eq!(state.subscriber_count(), 3);

        let info = state.finalize().unwrap();

        assert_eq!(rx1.await.unwrap(), info);
        assert_eq!(rx3.await.unwrap(), info);
        assert_eq!(state.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_after_finalize_is_closed() {
        let mut state = state();
        state.finalize().unwrap();

        let (tx, rx) = oneshot::channel();
        state.subscribe(tx);

        assert!(rx.await.is_err());
    }
}
