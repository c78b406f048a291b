//! KRPC messages of the mainline DHT, including the BEP33 scrape extension.

use crate::{
    bloom::BloomFilter,
    info_hash::{InfoHash, NodeId},
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Decode the message from bencode.
    pub fn decode(input: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(input)
    }

    /// Encode the message into bencode.
    pub fn encode(&self) -> Vec<u8> {
        // `expect` should be fine here as there should be no reason why a serialization into a
        // `Vec` would fail unless we have a bug somewhere.
        serde_bencode::to_bytes(self).expect("failed to serialize message")
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub enum MessageBody {
    #[serde(rename = "q")]
    Request(Request),
    #[serde(rename = "r", with = "unflatten::response")]
    Response(Response),
}

// Opposite of `serde(flatten)` - artificially add one level of nesting to a field.
mod unflatten {
    macro_rules! impl_unflatten {
        ($mod:ident, $field:literal) => {
            pub(crate) mod $mod {
                use serde::{Deserialize, Deserializer, Serialize, Serializer};

                #[derive(Serialize, Deserialize)]
                struct Wrapper<T> {
                    #[serde(rename = $field)]
                    field: T,
                }

                pub(crate) fn serialize<T: Serialize, S: Serializer>(
                    value: &T,
                    s: S,
                ) -> Result<S::Ok, S::Error> {
                    Wrapper { field: value }.serialize(s)
                }

                pub(crate) fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
                    d: D,
                ) -> Result<T, D::Error> {
                    let wrapper = Wrapper::deserialize(d)?;
                    Ok(wrapper.field)
                }
            }
        };
    }

    impl_unflatten!(response, "r");
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Ping(PingRequest),
    GetPeers(GetPeersRequest),
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub id: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct GetPeersRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,

    #[serde(with = "want", default, skip_serializing_if = "Option::is_none")]
    pub want: Option<Want>,

    /// Ask the node to attach the BEP33 `BFsd`/`BFpe` filters to its response.
    #[serde(with = "flag", default, skip_serializing_if = "is_false")]
    pub scrape: bool,

    /// Ask the node not to return seeders in `values` (BEP33).
    #[serde(with = "flag", default, skip_serializing_if = "is_false")]
    pub noseed: bool,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Want {
    // The peer wants only ipv4 contacts
    V4,
    // The peer wants only ipv6 contacts
    V6,
    // The peer wants both ipv4 and ipv6 contacts
    Both,
}

mod want {
    use super::Want;
    use serde::{
        de::{SeqAccess, Visitor},
        ser::SerializeSeq,
        Deserializer, Serializer,
    };
    use serde_bytes::Bytes;
    use std::fmt;

    pub(super) fn serialize<S: Serializer>(want: &Option<Want>, s: S) -> Result<S::Ok, S::Error> {
        let len = match want {
            None => 0,
            Some(Want::V4 | Want::V6) => 1,
            Some(Want::Both) => 2,
        };

        let mut seq = s.serialize_seq(Some(len))?;

        if matches!(want, Some(Want::V4 | Want::Both)) {
            seq.serialize_element(Bytes::new(b"n4"))?;
        }

        if matches!(want, Some(Want::V6 | Want::Both)) {
            seq.serialize_element(Bytes::new(b"n6"))?;
        }

        seq.end()
    }

    pub(super) fn deserialize<'de, D>(d: D) -> Result<Option<Want>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct WantVisitor;

        impl<'de> Visitor<'de> for WantVisitor {
            type Value = Option<Want>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a list of strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut value = None;

                while let Some(s) = seq.next_element::<String>()? {
                    value = match (value, s.as_str().trim()) {
                        (None, "n4" | "N4") => Some(Want::V4),
                        (None, "n6" | "N6") => Some(Want::V6),
                        (Some(Want::V4), "n6" | "N6") => Some(Want::Both),
                        (Some(Want::V6), "n4" | "N4") => Some(Want::Both),
                        (_, _) => value,
                    }
                }

                Ok(value)
            }
        }

        d.deserialize_seq(WantVisitor)
    }
}

// Boolean flags are encoded as integers (`i1e`).
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*value))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let num = i64::deserialize(d)?;
        Ok(num > 0)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Response to any query. Only the fields this crate cares about are decoded, everything else
/// (`nodes`, `values`, ...) is skipped.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: NodeId,

    #[serde(
        with = "serde_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<Vec<u8>>,

    /// Raw BEP33 seeders filter.
    #[serde(
        rename = "BFsd",
        with = "serde_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bf_seeders: Option<Vec<u8>>,

    /// Raw BEP33 peers filter.
    #[serde(
        rename = "BFpe",
        with = "serde_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bf_peers: Option<Vec<u8>>,
}

impl Response {
    /// Response without any optional fields.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            token: None,
            bf_seeders: None,
            bf_peers: None,
        }
    }

    /// Attach scrape filters.
    pub fn with_scrape(mut self, seeders: Option<BloomFilter>, peers: Option<BloomFilter>) -> Self {
        self.bf_seeders = seeders.map(|f| f.as_ref().to_vec());
        self.bf_peers = peers.map(|f| f.as_ref().to_vec());
        self
    }

    /// Does the response carry at least one of the scrape fields (valid or not)?
    pub fn has_scrape(&self) -> bool {
        self.bf_seeders.is_some() || self.bf_peers.is_some()
    }

    /// The seeders and peers filters. A field of the wrong length is treated as missing.
    pub fn scrape(&self) -> (Option<BloomFilter>, Option<BloomFilter>) {
        (
            BloomFilter::from_field(self.bf_seeders.as_deref()),
            BloomFilter::from_field(self.bf_peers.as_deref()),
        )
    }
}
