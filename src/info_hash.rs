use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
};
use thiserror::Error;

/// Length of `InfoHash` in bytes.
pub const INFO_HASH_LEN: usize = 20;

/// 20-byte long identifier of a torrent (and of nodes on the DHT).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct InfoHash(#[serde(with = "byte_array")] [u8; INFO_HASH_LEN]);

impl InfoHash {
    /// Create an InfoHash by hashing the given bytes using SHA-1.
    pub fn sha1(bytes: &[u8]) -> Self {
        let hash = Sha1::digest(bytes);
        Self(hash.into())
    }
}

impl AsRef<[u8]> for InfoHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<InfoHash> for [u8; INFO_HASH_LEN] {
    fn from(hash: InfoHash) -> [u8; INFO_HASH_LEN] {
        hash.0
    }
}

impl From<[u8; INFO_HASH_LEN]> for InfoHash {
    fn from(hash: [u8; INFO_HASH_LEN]) -> InfoHash {
        Self(hash)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid info hash length {0} (expected {INFO_HASH_LEN})")]
pub struct LengthError(pub usize);

impl<'a> TryFrom<&'a [u8]> for InfoHash {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(
            slice.try_into().map_err(|_| LengthError(slice.len()))?,
        ))
    }
}

impl Distribution<InfoHash> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> InfoHash {
        InfoHash(rng.gen())
    }
}

impl fmt::LowerHex for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:x}")
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:x}")
    }
}

mod byte_array {
    use super::INFO_HASH_LEN;
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::convert::TryInto;

    pub(super) fn serialize<S: Serializer>(
        bytes: &[u8; INFO_HASH_LEN],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; INFO_HASH_LEN], D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        let buf = buf.into_vec();
        let len = buf.len();

        buf.try_into().map_err(|_| {
            let expected = format!("{INFO_HASH_LEN}");
            D::Error::invalid_length(len, &expected.as_ref())
        })
    }
}

// ----------------------------------------------------------------------------//

/// Bittorrent `NodeId`.
pub type NodeId = InfoHash;

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_from_exact_length() {
        let bytes = [7u8; INFO_HASH_LEN];
        let hash = InfoHash::try_from(&bytes[..]).unwrap();

        assert_eq!(<[u8; INFO_HASH_LEN]>::from(hash), bytes);
    }

    #[test]
    fn try_from_wrong_length() {
        assert_eq!(InfoHash::try_from(&[0u8; 19][..]), Err(LengthError(19)));
        assert_eq!(InfoHash::try_from(&[0u8; 21][..]), Err(LengthError(21)));
        assert_eq!(InfoHash::try_from(&[0u8; 0][..]), Err(LengthError(0)));
    }

    #[test]
    fn equality_is_bytewise() {
        let a = InfoHash::sha1(b"foo");
        let b = InfoHash::try_from(a.as_ref()).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, InfoHash::sha1(b"bar"));
    }

    #[test]
    fn random() {
        let a: InfoHash = rand::random();
        let b: InfoHash = rand::random();

        assert_ne!(a, b);
    }

    #[test]
    fn debug_prints_hex() {
        let hash = InfoHash::from(*b"abcdefghij0123456789");

        assert_eq!(
            format!("{hash:?}"),
            "6162636465666768696a30313233343536373839"
        );
    }

    #[test]
    fn bencode_round_trip() {
        let hash = InfoHash::from(*b"mnopqrstuvwxyz123456");
        let encoded = serde_bencode::to_bytes(&hash).unwrap();

        assert_eq!(encoded, b"20:mnopqrstuvwxyz123456");
        assert_eq!(serde_bencode::from_bytes::<InfoHash>(&encoded).unwrap(), hash);
    }
}
