//! Payload codecs.
//!
//! Every encoded payload starts with a one-byte tag naming the codec that
//! produced it, so a receiver decodes with whatever the sender chose
//! regardless of its own configuration. The set of codecs is fixed at
//! compile time in [`REGISTRY`].

use std::{fmt, str::FromStr};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{IpcError, Result};

/// A registered payload serializer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Compact binary encoding via `bincode`
    Bincode,
    /// Self-describing JSON via `serde_json`
    Json,
}

/// All codecs a receiver can decode, keyed by [`Codec::tag`]
pub const REGISTRY: [Codec; 2] = [Codec::Bincode, Codec::Json];

impl Codec {
    /// Stable wire tag. Never reuse a retired value.
    pub const fn tag(self) -> u8 {
        match self {
            Codec::Bincode => 0x01,
            Codec::Json => 0x02,
        }
    }

    /// Look up a codec by its wire tag
    pub fn from_tag(tag: u8) -> Result<Self> {
        REGISTRY
            .iter()
            .copied()
            .find(|codec| codec.tag() == tag)
            .ok_or(IpcError::UnknownCodec(tag))
    }

    /// Encode `value` as a tagged payload
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        let mut out = vec![self.tag()];
        match self {
            Codec::Bincode => bincode::serialize_into(&mut out, value)
                .map_err(|e| IpcError::Encode(e.to_string()))?,
            Codec::Json => serde_json::to_writer(&mut out, value)
                .map_err(|e| IpcError::Encode(e.to_string()))?,
        }
        Ok(out)
    }

    /// Decode a tagged payload, dispatching on its tag
    pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
        let (&tag, body) = payload
            .split_first()
            .ok_or_else(|| IpcError::Decode("empty payload".to_string()))?;

        match Self::from_tag(tag)? {
            Codec::Bincode => {
                bincode::deserialize(body).map_err(|e| IpcError::Decode(e.to_string()))
            }
            Codec::Json => {
                serde_json::from_slice(body).map_err(|e| IpcError::Decode(e.to_string()))
            }
        }
    }
}

impl FromStr for Codec {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bincode" => Ok(Codec::Bincode),
            "json" => Ok(Codec::Json),
            other => Err(IpcError::Config(format!("unknown codec: {other}"))),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Bincode => f.write_str("bincode"),
            Codec::Json => f.write_str("json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        id:    u32,
        tags:  Vec<String>,
        extra: Option<BTreeMap<String, (i64, bool)>>,
    }

    fn sample() -> Job {
        let mut extra = BTreeMap::new();
        extra.insert("retries".to_string(), (3, true));
        Job {
            id:    7,
            tags:  vec!["a".into(), "b".into()],
            extra: Some(extra),
        }
    }

    #[test]
    fn payload_carries_codec_tag() {
        let bytes = Codec::Json.encode(&sample()).unwrap();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(Codec::decode::<Job>(&bytes).unwrap(), sample());

        let bytes = Codec::Bincode.encode(&sample()).unwrap();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(Codec::decode::<Job>(&bytes).unwrap(), sample());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        match Codec::decode::<u32>(&[0x7f, 0, 0, 0, 0]) {
            Err(IpcError::UnknownCodec(0x7f)) => {}
            other => panic!("expected UnknownCodec, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload_is_a_decode_error() {
        assert!(matches!(Codec::decode::<u32>(&[]), Err(IpcError::Decode(_))));
    }

    #[test]
    fn registry_tags_are_unique() {
        for (i, a) in REGISTRY.iter().enumerate() {
            for b in &REGISTRY[i + 1..] {
                assert_ne!(a.tag(), b.tag());
            }
            assert_eq!(Codec::from_tag(a.tag()).unwrap(), *a);
        }
    }
}
