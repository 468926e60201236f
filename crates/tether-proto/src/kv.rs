//! Core key-value wire types: revisions, key-value pairs, mutation events.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serde helpers for 64-bit integers carried as decimal strings in JSON.
/// Accepts either a string or a bare number when deserializing, since both
/// appear in practice.
pub mod i64_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(i64),
            Str(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(n),
            Repr::Str(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

/// A monotonically increasing logical clock value assigned to every mutation
/// in the store. Serialized as a decimal string for JSON-safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Revision(#[serde(with = "i64_string")] pub i64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    /// The revision immediately after this one.
    pub fn succ(self) -> Revision {
        Revision(self.0 + 1)
    }

    /// The revision immediately before this one, saturating at zero.
    pub fn pred(self) -> Revision {
        Revision((self.0 - 1).max(0))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A server-side lease identifier. Serialized as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LeaseId(#[serde(with = "i64_string")] pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl LeaseId {
    /// Hexadecimal form used to derive election keys, matching etcd's own
    /// concurrency primitives.
    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }
}

/// Header present on every response, carrying the store revision at the time
/// the request was applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseHeader {
    pub cluster_id: String,
    pub member_id: String,
    pub revision: Revision,
    pub raft_term: String,
}

/// A key-value pair in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValue {
    pub key: Bytes,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    #[serde(with = "i64_string")]
    pub version: i64,
    pub value: Bytes,
    pub lease: LeaseId,
}

/// Kind of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "PUT", alias = "Put")]
    Put,
    #[serde(rename = "DELETE", alias = "Delete")]
    Delete,
}

/// A single mutation observed on a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub kv: KeyValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_kv: Option<KeyValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_round_trips_as_decimal_string() {
        let json = serde_json::to_string(&Revision(9_007_199_254_740_993)).unwrap();
        assert_eq!(json, "\"9007199254740993\"");
        let back: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Revision(9_007_199_254_740_993));
    }

    #[test]
    fn test_revision_accepts_bare_numbers() {
        let rev: Revision = serde_json::from_str("42").unwrap();
        assert_eq!(rev, Revision(42));
    }

    #[test]
    fn test_event_type_wire_names() {
        let ev = Event {
            event_type: EventType::Put,
            kv: KeyValue::default(),
            prev_kv: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "PUT");
    }

    #[test]
    fn test_lease_id_hex() {
        assert_eq!(LeaseId(0x1234abcd).to_hex(), "1234abcd");
    }
}
