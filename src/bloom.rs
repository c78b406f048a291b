//! Bloom filters of the BEP33 DHT scrape extension.
//!
//! A node that answers a `get_peers` query with `scrape=1` attaches two fixed-size bloom filters
//! to its response: `BFsd` summarizing the seeders it knows about and `BFpe` summarizing all the
//! peers. Filters from different nodes are combined by bit-wise OR and the number of distinct
//! inserted addresses is estimated from the number of bits that are still zero.
//!
//! See [BEP33](https://www.bittorrent.org/beps/bep_0033.html).

use serde_bencode::value::Value;
use sha1::{Digest, Sha1};
use std::{
    collections::HashMap,
    convert::{TryFrom, TryInto},
    fmt,
    net::IpAddr,
    ops::BitOr,
};
use thiserror::Error;

/// Length of a scrape bloom filter in bytes.
pub const BLOOM_FILTER_LEN: usize = 256;
/// Length of a scrape bloom filter in bits (`m`).
pub const BLOOM_FILTER_BITS: usize = BLOOM_FILTER_LEN * 8;
/// Saturation cap of the estimate. This is the maximum useful capacity of a 256 byte, `k = 2`
/// filter and is part of the BEP33 calibration.
pub const MAX_ESTIMATE: u32 = 6000;

/// Response key of the seeders filter.
pub const SEEDERS_KEY: &[u8] = b"BFsd";
/// Response key of the peers filter.
pub const PEERS_KEY: &[u8] = b"BFpe";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid bloom filter size {0} (expected {BLOOM_FILTER_LEN})")]
pub struct FilterSizeError(pub usize);

/// Fixed size (2048 bit) bloom filter.
///
/// Bit `i` of the filter is stored in byte `i / 8` at bit position `7 - i % 8` (most significant
/// bit first). Combining and estimating only ever OR whole bytes and count zero bits, so the bit
/// order matters for [`BloomFilter::insert`] only.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct BloomFilter([u8; BLOOM_FILTER_LEN]);

impl BloomFilter {
    /// Filter with no bits set.
    pub const EMPTY: Self = Self([0; BLOOM_FILTER_LEN]);

    pub fn as_bytes(&self) -> &[u8; BLOOM_FILTER_LEN] {
        &self.0
    }

    /// Bit-wise OR of the two filters.
    pub fn combine(&self, other: &Self) -> Self {
        let mut bytes = self.0;

        for (dst, src) in bytes.iter_mut().zip(other.0.iter()) {
            *dst |= *src;
        }

        Self(bytes)
    }

    /// Number of bits not set.
    pub fn zero_bits(&self) -> u32 {
        let ones: u32 = self.0.iter().map(|byte| byte.count_ones()).sum();
        BLOOM_FILTER_BITS as u32 - ones
    }

    /// Is every bit set in `self` also set in `other`?
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a & b == *a)
    }

    /// Estimated number of distinct items inserted into the filter, in `[0, MAX_ESTIMATE]`.
    pub fn estimate(&self) -> u32 {
        let zeros = self.zero_bits();

        // The formula diverges for a saturated filter.
        if zeros == 0 {
            return MAX_ESTIMATE;
        }

        let m = BLOOM_FILTER_BITS as f64;
        let c = f64::from(zeros.clamp(1, BLOOM_FILTER_BITS as u32 - 1));
        let n = (c / m).ln() / (2.0 * (1.0 - 1.0 / m).ln());

        // `as` truncates toward zero and maps NaN and negative values to 0.
        (n as u32).min(MAX_ESTIMATE)
    }

    /// Insert an item using the two BEP33 hash functions: the first and the second little-endian
    /// 16 bit word of the SHA-1 digest of `item`, modulo the number of bits.
    pub fn insert(&mut self, item: &[u8]) {
        let digest = Sha1::digest(item);

        for index in [
            u16::from_le_bytes([digest[0], digest[1]]),
            u16::from_le_bytes([digest[2], digest[3]]),
        ] {
            self.set_bit(usize::from(index) % BLOOM_FILTER_BITS);
        }
    }

    /// Insert a peer address the way nodes answering scrape requests do (network byte order
    /// octets of the address).
    pub fn insert_ip(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(ip) => self.insert(&ip.octets()),
            IpAddr::V6(ip) => self.insert(&ip.octets()),
        }
    }

    fn set_bit(&mut self, index: usize) {
        self.0[index / 8] |= 0x80 >> (index % 8);
    }

    /// Interpret an optional response field. Anything but exactly `BLOOM_FILTER_LEN` bytes is
    /// treated as if the field was missing.
    pub(crate) fn from_field(field: Option<&[u8]>) -> Option<Self> {
        let bytes = field?;

        match Self::try_from(bytes) {
            Ok(filter) => Some(filter),
            Err(error) => {
                log::trace!("Ignoring scrape field: {}", error);
                None
            }
        }
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl AsRef<[u8]> for BloomFilter {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; BLOOM_FILTER_LEN]> for BloomFilter {
    fn from(bytes: [u8; BLOOM_FILTER_LEN]) -> Self {
        Self(bytes)
    }
}

impl<'a> TryFrom<&'a [u8]> for BloomFilter {
    type Error = FilterSizeError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(
            slice
                .try_into()
                .map_err(|_| FilterSizeError(slice.len()))?,
        ))
    }
}

impl BitOr for BloomFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.combine(&rhs)
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "BloomFilter {{ set_bits: {}, estimate: {} }}",
            BLOOM_FILTER_BITS as u32 - self.zero_bits(),
            self.estimate()
        )
    }
}

/// Bit-wise OR of two raw filters.
pub fn combine(a: &[u8], b: &[u8]) -> Result<BloomFilter, FilterSizeError> {
    let a = BloomFilter::try_from(a)?;
    let b = BloomFilter::try_from(b)?;

    Ok(a.combine(&b))
}

/// Estimated population of a raw filter.
pub fn estimate(filter: &[u8]) -> Result<u32, FilterSizeError> {
    Ok(BloomFilter::try_from(filter)?.estimate())
}

/// Extract the seeders (`BFsd`) and peers (`BFpe`) filters from a decoded `get_peers` response
/// dictionary (the `r` dictionary of the KRPC message).
///
/// Only these exact key spellings are recognized. A side whose key is missing, whose value is not
/// a byte string, or whose length is not `BLOOM_FILTER_LEN` yields `None`.
pub fn parse_scrape(
    dict: &HashMap<Vec<u8>, Value>,
) -> (Option<BloomFilter>, Option<BloomFilter>) {
    let field = |key: &[u8]| match dict.get(key) {
        Some(Value::Bytes(bytes)) => BloomFilter::from_field(Some(bytes.as_slice())),
        _ => None,
    };

    (field(SEEDERS_KEY), field(PEERS_KEY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn with_bits(indices: &[usize]) -> BloomFilter {
        let mut filter = BloomFilter::EMPTY;
        for &index in indices {
            filter.set_bit(index);
        }
        filter
    }

    #[test]
    fn combine_is_bitwise_or() {
        let a = with_bits(&[0, 9, 2047]);
        let b = with_bits(&[9, 100]);
        let c = a.combine(&b);

        assert_eq!(c, with_bits(&[0, 9, 100, 2047]));
        assert!(a.is_subset_of(&c));
        assert!(b.is_subset_of(&c));
        assert_eq!(a | b, c);
    }

    #[test]
    fn combine_laws() {
        let a = with_bits(&[1, 2, 3]);
        let b = with_bits(&[3, 500]);
        let c = with_bits(&[1000, 1500, 2000]);

        assert_eq!(a.combine(&a), a);
        assert_eq!(a.combine(&b), b.combine(&a));
        assert_eq!(a.combine(&b).combine(&c), a.combine(&b.combine(&c)));
    }

    #[test]
    fn raw_combine_rejects_wrong_size() {
        let good = [0u8; BLOOM_FILTER_LEN];

        assert_eq!(combine(&good, &[0u8; 255]), Err(FilterSizeError(255)));
        assert_eq!(combine(&[0u8; 257], &good), Err(FilterSizeError(257)));
        assert_eq!(combine(&good, &[0xff; BLOOM_FILTER_LEN]).unwrap().zero_bits(), 0);
    }

    #[test]
    fn raw_estimate_rejects_wrong_size() {
        assert_eq!(estimate(&[0u8; 20]), Err(FilterSizeError(20)));
        assert_eq!(estimate(&[0u8; BLOOM_FILTER_LEN]), Ok(0));
    }

    #[test]
    fn estimate_of_empty_filter_is_zero() {
        assert_eq!(BloomFilter::EMPTY.estimate(), 0);
    }

    #[test]
    fn estimate_of_saturated_filter_is_capped() {
        assert_eq!(BloomFilter::from([0xff; BLOOM_FILTER_LEN]).estimate(), MAX_ESTIMATE);
    }

    #[test]
    fn estimate_with_single_zero_bit_is_capped() {
        let mut bytes = [0xff; BLOOM_FILTER_LEN];
        bytes[17] = 0xfe;

        assert_eq!(BloomFilter::from(bytes).estimate(), MAX_ESTIMATE);
    }

    #[test]
    fn estimate_of_sparse_filters() {
        assert_eq!(with_bits(&[5]).estimate(), 0);
        assert_eq!(with_bits(&[5, 700]).estimate(), 1);
        assert_eq!(with_bits(&[5, 700, 1200]).estimate(), 1);
    }

    #[test]
    fn estimate_is_monotonic() {
        let mut filter = BloomFilter::EMPTY;
        let mut previous = filter.estimate();

        // Walk through the bits in a scattered order.
        for step in 0..BLOOM_FILTER_BITS {
            filter.set_bit((step * 997) % BLOOM_FILTER_BITS);

            let current = filter.estimate();
            assert!(current >= previous, "{current} < {previous} at step {step}");
            assert!(current <= MAX_ESTIMATE);
            previous = current;
        }

        assert_eq!(previous, MAX_ESTIMATE);
    }

    #[test]
    fn estimate_tracks_inserted_addresses() {
        let mut filter = BloomFilter::EMPTY;

        for i in 0..200u32 {
            filter.insert_ip(IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)));
        }

        let estimate = filter.estimate();
        assert!((180..=220).contains(&estimate), "estimate {estimate}");
    }

    #[test]
    fn insert_sets_at_most_two_bits() {
        let mut filter = BloomFilter::EMPTY;
        filter.insert_ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));

        let set = BLOOM_FILTER_BITS as u32 - filter.zero_bits();
        assert!(set == 1 || set == 2);

        let copy = filter;
        filter.insert_ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(filter, copy);
    }

    #[test]
    fn parse_scrape_both_sides() {
        let seeders = with_bits(&[1]);
        let peers = with_bits(&[2, 3]);

        let mut dict = HashMap::new();
        dict.insert(b"id".to_vec(), Value::Bytes(b"abcdefghij0123456789".to_vec()));
        dict.insert(SEEDERS_KEY.to_vec(), Value::Bytes(seeders.as_ref().to_vec()));
        dict.insert(PEERS_KEY.to_vec(), Value::Bytes(peers.as_ref().to_vec()));

        assert_eq!(parse_scrape(&dict), (Some(seeders), Some(peers)));
    }

    #[test]
    fn parse_scrape_after_bencode() {
        let seeders = with_bits(&[10, 20]);
        let peers = with_bits(&[30]);

        let mut dict = HashMap::new();
        dict.insert(SEEDERS_KEY.to_vec(), Value::Bytes(seeders.as_ref().to_vec()));
        dict.insert(PEERS_KEY.to_vec(), Value::Bytes(peers.as_ref().to_vec()));

        let encoded = serde_bencode::to_bytes(&Value::Dict(dict)).unwrap();
        let decoded = match serde_bencode::from_bytes::<Value>(&encoded).unwrap() {
            Value::Dict(dict) => dict,
            other => panic!("unexpected value {other:?}"),
        };

        assert_eq!(parse_scrape(&decoded), (Some(seeders), Some(peers)));
    }

    #[test]
    fn parse_scrape_missing_and_malformed_sides() {
        let mut dict = HashMap::new();
        assert_eq!(parse_scrape(&dict), (None, None));

        dict.insert(SEEDERS_KEY.to_vec(), Value::Bytes(vec![0xff; 128]));
        dict.insert(PEERS_KEY.to_vec(), Value::Int(1));
        assert_eq!(parse_scrape(&dict), (None, None));

        dict.insert(PEERS_KEY.to_vec(), Value::Bytes(vec![0; BLOOM_FILTER_LEN]));
        assert_eq!(parse_scrape(&dict), (None, Some(BloomFilter::EMPTY)));
    }

    #[test]
    fn parse_scrape_ignores_other_spellings() {
        let mut dict = HashMap::new();
        dict.insert(b"bfsd".to_vec(), Value::Bytes(vec![0xff; BLOOM_FILTER_LEN]));
        dict.insert(b"bfpe".to_vec(), Value::Bytes(vec![0xff; BLOOM_FILTER_LEN]));

        assert_eq!(parse_scrape(&dict), (None, None));
    }
}
