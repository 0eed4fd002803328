use crosstab_log::{Action, Entry, EntryId, LogEvent, Meta};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::liveness::tab_reason;

/// Action type marking a subscription request.
pub const SUBSCRIBE_TYPE: &str = "crosstab/subscribe";

/// Whether `action` is a subscription request.
#[must_use]
pub fn is_subscription(action: &Action) -> bool {
    action.get("type").and_then(Action::as_str) == Some(SUBSCRIBE_TYPE)
}

/// A log mutation broadcast to other tabs: `[origin, action, meta]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationRecord {
    /// The tab whose log changed.
    pub origin: String,

    /// The entry's payload.
    pub action: Action,

    /// The entry's metadata.
    pub meta: Meta,
}

impl Serialize for MutationRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.origin, &self.action, &self.meta).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MutationRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (origin, action, meta) = <(String, Action, Meta)>::deserialize(deserializer)?;

        Ok(Self {
            origin,
            action,
            meta,
        })
    }
}

/// Decides what crosses tab boundaries and keeps the subscription view.
#[derive(Debug)]
pub struct LogMirror {
    tab_id: String,
    scope: String,
    subscriptions: IndexMap<EntryId, Action>,
}

impl LogMirror {
    pub fn new(tab_id: String, scope: String) -> Self {
        Self {
            tab_id,
            scope,
            subscriptions: IndexMap::new(),
        }
    }

    /// The broadcast for a local log change. Replicas are never sent back.
    pub fn outgoing(&self, event: &LogEvent) -> Option<MutationRecord> {
        let Entry { action, meta } = event.entry();
        if meta.received {
            return None;
        }

        Some(MutationRecord {
            origin: self.tab_id.clone(),
            action: action.clone(),
            meta: meta.clone(),
        })
    }

    pub fn is_own(&self, record: &MutationRecord) -> bool {
        record.origin == self.tab_id
    }

    /// Whether an entry is meant for this tab. Untargeted entries are meant
    /// for every tab.
    pub fn is_addressed_to_us(&self, meta: &Meta) -> bool {
        meta.tab.as_deref().is_none_or(|tab| tab == self.tab_id)
    }

    /// Metadata for the local copy of an entry from `origin`.
    ///
    /// The copy is marked as received. Without reasons of its own it is kept
    /// alive by its origin's tab reason.
    pub fn replica(origin: &str, mut meta: Meta) -> Meta {
        meta.received = true;
        if meta.reasons.is_empty() {
            meta.reasons.push(tab_reason(origin));
        }
        meta
    }

    /// The identifier under which an entry from `origin` reaches the remote
    /// peer.
    pub fn outbound_id(&self, origin: &str, id: &EntryId) -> EntryId {
        id.with_node(format!("{}:{origin}", self.scope))
    }

    /// Updates the subscription view. Returns whether it changed.
    pub fn track(&mut self, event: &LogEvent) -> bool {
        match event {
            LogEvent::Added(entry) if is_subscription(&entry.action) => {
                if self.subscriptions.contains_key(&entry.meta.id) {
                    return false;
                }
                self.subscriptions
                    .insert(entry.meta.id.clone(), entry.action.clone());
                true
            }
            LogEvent::Cleaned(entry) => self.subscriptions.shift_remove(&entry.meta.id).is_some(),
            LogEvent::Added(_) => false,
        }
    }

    /// Active subscriptions, oldest first.
    pub fn subscriptions(&self) -> Vec<Action> {
        self.subscriptions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn mirror() -> LogMirror {
        LogMirror::new("a".into(), "10".into())
    }

    fn entry(action: Action, id: EntryId) -> Entry {
        Entry::new(action, Meta::new(id))
    }

    #[test]
    fn test_record_encoding() {
        let record = MutationRecord {
            origin: "a".into(),
            action: json!({ "type": "A" }),
            meta: Meta::new(EntryId::new(1, "10:a", 0)),
        };

        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(
            encoded,
            json!(["a", { "type": "A" }, { "id": "1 10:a 0", "time": 1, "reasons": [] }])
        );
        assert_eq!(
            serde_json::from_value::<MutationRecord>(encoded).unwrap(),
            record
        );

        assert!(serde_json::from_str::<MutationRecord>(r#"["a", {}]"#).is_err());
        assert!(serde_json::from_str::<MutationRecord>(r#"["a", {}, {"id": "bad"}]"#).is_err());
    }

    #[test]
    fn test_replicas_are_not_echoed() {
        let mirror = mirror();
        let local = entry(json!({ "type": "A" }), EntryId::new(1, "10:a", 0));

        let record = mirror.outgoing(&LogEvent::Added(local.clone())).unwrap();
        assert_eq!(record.origin, "a");
        assert!(mirror.is_own(&record));

        let replica = Entry::new(local.action, LogMirror::replica("b", local.meta));
        assert!(mirror.outgoing(&LogEvent::Added(replica)).is_none());
    }

    #[test]
    fn test_replica_keeps_reasons_or_borrows_origin() {
        let meta = Meta::new(EntryId::new(1, "10:b", 0));

        let orphan = LogMirror::replica("b", meta.clone());
        assert!(orphan.received);
        assert_eq!(orphan.reasons, vec![tab_reason("b")]);

        let kept = LogMirror::replica("b", meta.with_reason("test"));
        assert_eq!(kept.reasons, vec!["test".to_string()]);
    }

    #[test]
    fn test_targeting() {
        let mirror = mirror();
        let meta = Meta::new(EntryId::new(1, "10:b", 0));

        assert!(mirror.is_addressed_to_us(&meta));
        assert!(mirror.is_addressed_to_us(&meta.clone().with_tab("a")));
        assert!(!mirror.is_addressed_to_us(&meta.with_tab("c")));
    }

    #[test]
    fn test_outbound_id_names_origin() {
        let mirror = mirror();
        let id = EntryId::new(5, "10:b", 2);

        assert_eq!(mirror.outbound_id("b", &id).to_string(), "5 10:b 2");
        assert_eq!(mirror.outbound_id("c", &id).to_string(), "5 10:c 2");
    }

    #[test]
    fn test_subscriptions_are_coalesced() {
        let mut mirror = mirror();
        let subscribe = json!({ "type": SUBSCRIBE_TYPE, "channel": "users" });
        let first = entry(subscribe.clone(), EntryId::new(1, "10:a", 0));
        let other = entry(json!({ "type": "A" }), EntryId::new(2, "10:a", 0));

        assert!(mirror.track(&LogEvent::Added(first.clone())));
        assert!(!mirror.track(&LogEvent::Added(first.clone())));
        assert!(!mirror.track(&LogEvent::Added(other.clone())));
        assert_eq!(mirror.subscriptions(), vec![subscribe]);

        assert!(!mirror.track(&LogEvent::Cleaned(other)));
        assert!(mirror.track(&LogEvent::Cleaned(first)));
        assert!(mirror.subscriptions().is_empty());
    }
}
