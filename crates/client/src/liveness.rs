use std::collections::BTreeSet;
use std::time::Duration;

use crosstab_log::Entry;

use crate::config::millis;
use crate::keys::StorageKeys;

/// Prefix of the reason that ties an entry to a single tab.
pub const TAB_REASON_PREFIX: &str = "tab";

/// The reason keeping an entry alive for as long as tab `id` lives.
#[must_use]
pub fn tab_reason(id: &str) -> String {
    format!("{TAB_REASON_PREFIX}{id}")
}

/// The tab a reason belongs to, if it is a tab reason.
#[must_use]
pub fn reason_owner(reason: &str) -> Option<&str> {
    reason
        .strip_prefix(TAB_REASON_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Whether `id` has the shape of a generated tab id: a simple-form UUID.
fn is_generated_id(id: &str) -> bool {
    id.len() == 32
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Judges which tabs are gone.
#[derive(Clone, Debug)]
pub struct Liveness {
    tab_id: String,
    tab_timeout: Duration,
}

impl Liveness {
    pub const fn new(tab_id: String, tab_timeout: Duration) -> Self {
        Self {
            tab_id,
            tab_timeout,
        }
    }

    /// Every other tab owning at least one of `entries`.
    ///
    /// A reason only names a tab when that tab has a heartbeat key among
    /// `heartbeats` or a generated id. Application reasons that merely start
    /// with the prefix, like `tables`, name nobody.
    pub fn owners(&self, entries: &[Entry], heartbeats: &BTreeSet<String>) -> BTreeSet<String> {
        entries
            .iter()
            .flat_map(|entry| &entry.meta.reasons)
            .filter_map(|reason| reason_owner(reason))
            .filter(|owner| *owner != self.tab_id)
            .filter(|owner| heartbeats.contains(*owner) || is_generated_id(owner))
            .map(str::to_string)
            .collect()
    }

    /// Every other tab with a heartbeat key among `keys`.
    pub fn heartbeat_owners(&self, layout: &StorageKeys, keys: &[String]) -> BTreeSet<String> {
        keys.iter()
            .filter_map(|key| layout.tab_owner(key))
            .filter(|owner| *owner != self.tab_id)
            .map(str::to_string)
            .collect()
    }

    /// Whether a heartbeat is missing, unreadable or older than the tab
    /// timeout.
    pub fn is_stale(&self, heartbeat: Option<&str>, now: u64) -> bool {
        heartbeat
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .is_none_or(|seen| now.saturating_sub(seen) > millis(self.tab_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crosstab_log::{EntryId, Meta};
    use serde_json::json;

    fn entry(reasons: &[&str]) -> Entry {
        let mut meta = Meta::new(EntryId::new(1, "10:x", 0));
        meta.reasons = reasons.iter().map(|r| (*r).to_string()).collect();
        Entry::new(json!({ "type": "A" }), meta)
    }

    #[test]
    fn test_tab_reasons() {
        assert_eq!(tab_reason("abc"), "tababc");
        assert_eq!(reason_owner("tababc"), Some("abc"));
        assert_eq!(reason_owner("tab"), None);
        assert_eq!(reason_owner("test"), None);
    }

    fn heartbeats(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| (*id).to_string()).collect()
    }

    #[test]
    fn test_owners_skip_self() {
        let liveness = Liveness::new("a".into(), Duration::from_secs(60));
        let entries = [
            entry(&["taba"]),
            entry(&["tabb", "keep"]),
            entry(&["tabc"]),
            entry(&["tabb"]),
        ];

        let owners: Vec<_> = liveness
            .owners(&entries, &heartbeats(&["a", "b", "c"]))
            .into_iter()
            .collect();
        assert_eq!(owners, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_owners_need_heartbeat_or_generated_id() {
        let liveness = Liveness::new("a".into(), Duration::from_secs(60));
        let generated = "0123456789abcdef0123456789abcdef";
        let entries = [
            entry(&["tables"]),
            entry(&["tabb"]),
            entry(&[&tab_reason(generated)]),
            entry(&["tab0123456789ABCDEF0123456789ABCDEF"]),
        ];

        let owners: Vec<_> = liveness
            .owners(&entries, &heartbeats(&["b"]))
            .into_iter()
            .collect();
        assert_eq!(owners, vec![generated.to_string(), "b".to_string()]);
    }

    #[test]
    fn test_heartbeat_owners() {
        let liveness = Liveness::new("a".into(), Duration::from_secs(60));
        let layout = StorageKeys::new("crosstab", "10");
        let keys = [
            "crosstab:tab:a".to_string(),
            "crosstab:tab:b".to_string(),
            "crosstab:10:leader".to_string(),
        ];

        let owners: Vec<_> = liveness.heartbeat_owners(&layout, &keys).into_iter().collect();
        assert_eq!(owners, vec!["b".to_string()]);
    }

    #[test]
    fn test_staleness() {
        let liveness = Liveness::new("a".into(), Duration::from_secs(60));

        assert!(liveness.is_stale(None, 100_000));
        assert!(liveness.is_stale(Some("garbage"), 100_000));
        assert!(liveness.is_stale(Some("39999"), 100_000));
        assert!(!liveness.is_stale(Some("40000"), 100_000));
        assert!(!liveness.is_stale(Some("100000"), 100_000));
    }
}
