use crate::info_hash::InfoHash;
use std::{collections::HashMap, fmt};

/// Opaque KRPC transaction id chosen by the host DHT engine.
///
/// Transaction ids are reused by the engine over time, so an id identifies a query only until the
/// engine announces the next query with the same id.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct TransactionId(Vec<u8>);

impl AsRef<[u8]> for TransactionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for TransactionId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }

        Ok(())
    }
}

/// Maps the transaction ids of outstanding `get_peers` queries to the info hash they were sent
/// for.
///
/// The registry stays small without an eviction policy: entries are overwritten when the engine
/// reuses an id and swept when the lookup of their info hash finalizes.
#[derive(Default)]
pub(crate) struct TransactionRegistry {
    entries: HashMap<TransactionId, InfoHash>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tid` to `info_hash`, replacing any previous binding of `tid`.
    pub fn bind(&mut self, tid: TransactionId, info_hash: InfoHash) {
        if let Some(previous) = self.entries.insert(tid, info_hash) {
            if previous != info_hash {
                log::trace!("Transaction id rebound from {:?} to {:?}", previous, info_hash);
            }
        }
    }

    pub fn lookup(&self, tid: &TransactionId) -> Option<InfoHash> {
        self.entries.get(tid).copied()
    }

    pub fn unbind(&mut self, tid: &TransactionId) -> Option<InfoHash> {
        self.entries.remove(tid)
    }

    /// Remove every transaction bound to `info_hash`. Returns the number of removed entries.
    pub fn unbind_all_for(&mut self, info_hash: &InfoHash) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, bound| bound != info_hash);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(bytes: &[u8]) -> TransactionId {
        TransactionId::from(bytes)
    }

    #[test]
    fn lookup_unknown() {
        let registry = TransactionRegistry::new();
        assert_eq!(registry.lookup(&tid(b"\x00\x01")), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn lookup_does_not_remove() {
        let mut registry = TransactionRegistry::new();
        let a = InfoHash::sha1(b"a");

        registry.bind(tid(b"\x00\x01"), a);

        assert_eq!(registry.lookup(&tid(b"\x00\x01")), Some(a));
        assert_eq!(registry.lookup(&tid(b"\x00\x01")), Some(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rebind_overwrites() {
        let mut registry = TransactionRegistry::new();
        let a = InfoHash::sha1(b"a");
        let b = InfoHash::sha1(b"b");

        registry.bind(tid(b"\x00\x01"), a);
        registry.bind(tid(b"\x00\x01"), b);

        assert_eq!(registry.lookup(&tid(b"\x00\x01")), Some(b));
        assert_eq!(registry.len(), 1);

        // Rebinding to the same value is harmless too.
        registry.bind(tid(b"\x00\x01"), b);
        assert_eq!(registry.lookup(&tid(b"\x00\x01")), Some(b));
    }

    #[test]
    fn unbind_single() {
        let mut registry = TransactionRegistry::new();
        let a = InfoHash::sha1(b"a");

        registry.bind(tid(b"aa"), a);
        registry.bind(tid(b"ab"), a);

        assert_eq!(registry.unbind(&tid(b"aa")), Some(a));
        assert_eq!(registry.unbind(&tid(b"aa")), None);
        assert_eq!(registry.lookup(&tid(b"ab")), Some(a));
    }

    #[test]
    fn unbind_all_for_sweeps_only_that_info_hash() {
        let mut registry = TransactionRegistry::new();
        let a = InfoHash::sha1(b"a");
        let b = InfoHash::sha1(b"b");

        registry.bind(tid(b"\x00\x01"), a);
        registry.bind(tid(b"\x00\x02"), b);
        registry.bind(tid(b"\x00\x03"), a);

        assert_eq!(registry.unbind_all_for(&a), 2);
        assert_eq!(registry.lookup(&tid(b"\x00\x01")), None);
        assert_eq!(registry.lookup(&tid(b"\x00\x03")), None);
        assert_eq!(registry.lookup(&tid(b"\x00\x02")), Some(b));
        assert_eq!(registry.unbind_all_for(&a), 0);
    }

    #[test]
    fn transaction_id_debug_is_hex() {
        assert_eq!(format!("{:?}", tid(b"\x00\xab")), "00ab");
    }
}
