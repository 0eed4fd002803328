use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The payload of a log entry. Opaque to the log itself.
pub type Action = serde_json::Value;

/// Unique identifier of a log entry: `"<time> <node> <seq>"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    /// Creation time in milliseconds.
    pub time: u64,

    /// The node that created the entry, usually `<scope>:<tab>`.
    pub node: String,

    /// Disambiguates entries created by one node within one millisecond.
    pub seq: u64,
}

impl EntryId {
    /// Creates a new `EntryId`.
    pub fn new<N: Into<String>>(time: u64, node: N, seq: u64) -> Self {
        Self {
            time,
            node: node.into(),
            seq,
        }
    }

    /// Returns the same identifier attributed to another node.
    #[must_use]
    pub fn with_node<N: Into<String>>(&self, node: N) -> Self {
        Self {
            time: self.time,
            node: node.into(),
            seq: self.seq,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.time, self.node, self.seq)
    }
}

/// Error returned when an entry identifier cannot be parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseEntryIdError(String);

impl fmt::Display for ParseEntryIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid entry id: {:?}", self.0)
    }
}

impl std::error::Error for ParseEntryIdError {}

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryIdError(s.to_string());

        // The node part may itself contain spaces, so split from both ends.
        let (time, rest) = s.split_once(' ').ok_or_else(invalid)?;
        let (node, seq) = rest.rsplit_once(' ').ok_or_else(invalid)?;

        if node.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            time: time.parse().map_err(|_| invalid())?,
            node: node.to_string(),
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Metadata attached to every log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Unique identifier of the entry.
    pub id: EntryId,

    /// Logical creation time in milliseconds.
    #[serde(default)]
    pub time: u64,

    /// Tags keeping the entry alive. An entry without reasons is reclaimed.
    #[serde(default)]
    pub reasons: Vec<String>,

    /// Whether the entry must be synchronized with the remote peer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sync: bool,

    /// Restricts delivery of the entry to a single tab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<String>,

    /// Set on entries replayed from another tab. Never leaves the process.
    #[serde(skip)]
    pub received: bool,

    /// Fields this crate does not interpret, carried along untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Action>,
}

impl Meta {
    /// Creates metadata for `id` with no reasons.
    #[must_use]
    pub fn new(id: EntryId) -> Self {
        Self {
            time: id.time,
            id,
            reasons: Vec::new(),
            sync: false,
            tab: None,
            received: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Adds a reason keeping the entry alive.
    #[must_use]
    pub fn with_reason<R: Into<String>>(mut self, reason: R) -> Self {
        self.reasons.push(reason.into());
        self
    }

    /// Marks the entry for synchronization with the remote peer.
    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Restricts delivery of the entry to `tab`.
    #[must_use]
    pub fn with_tab<T: Into<String>>(mut self, tab: T) -> Self {
        self.tab = Some(tab.into());
        self
    }
}

/// A log entry: payload plus metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The payload.
    pub action: Action,

    /// The metadata.
    pub meta: Meta,
}

impl Entry {
    /// Creates a new `Entry`.
    #[must_use]
    pub const fn new(action: Action, meta: Meta) -> Self {
        Self { action, meta }
    }
}

/// Notification published by a log whenever its contents change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    /// An entry was added.
    Added(Entry),

    /// An entry was removed, either explicitly or because it ran out of
    /// reasons.
    Cleaned(Entry),
}

impl LogEvent {
    /// The entry the event is about.
    #[must_use]
    pub const fn entry(&self) -> &Entry {
        match self {
            Self::Added(entry) | Self::Cleaned(entry) => entry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_entry_id_round_trips_through_text() {
        let id: EntryId = "1 10:other 0".parse().unwrap();

        assert_eq!(id, EntryId::new(1, "10:other", 0));
        assert_eq!(id.to_string(), "1 10:other 0");
    }

    #[test]
    fn test_entry_id_rejects_garbage() {
        assert_matches!("".parse::<EntryId>(), Err(_));
        assert_matches!("1 A".parse::<EntryId>(), Err(_));
        assert_matches!("x A 0".parse::<EntryId>(), Err(_));
        assert_matches!("1  0".parse::<EntryId>(), Err(_));
    }

    #[test]
    fn test_meta_accepts_sparse_json() {
        let meta: Meta = serde_json::from_value(json!({ "id": "0 A 0", "sync": true })).unwrap();

        assert_eq!(meta.id, EntryId::new(0, "A", 0));
        assert!(meta.sync);
        assert!(meta.reasons.is_empty());
        assert!(!meta.received);
        assert!(meta.extra.is_empty());
    }

    #[test]
    fn test_meta_keeps_unknown_fields() {
        let raw = json!({
            "id": "1 10:b 0",
            "time": 1,
            "sync": true,
            "keepLast": "x",
            "subprotocol": "1.0.0",
        });

        let meta: Meta = serde_json::from_value(raw).unwrap();

        assert_eq!(meta.extra.get("keepLast"), Some(&json!("x")));
        assert_eq!(meta.extra.get("subprotocol"), Some(&json!("1.0.0")));
        assert_eq!(
            serde_json::to_value(&meta).unwrap(),
            json!({
                "id": "1 10:b 0",
                "time": 1,
                "reasons": [],
                "sync": true,
                "keepLast": "x",
                "subprotocol": "1.0.0",
            })
        );
    }

    #[test]
    fn test_meta_never_serializes_received_flag() {
        let mut meta = Meta::new(EntryId::new(5, "A", 1)).with_reason("tabA");
        meta.received = true;

        let value = serde_json::to_value(&meta).unwrap();

        assert_eq!(value, json!({ "id": "5 A 1", "time": 5, "reasons": ["tabA"] }));
    }
}
