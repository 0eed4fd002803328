use crosstab_store::{SharedStore, StorageEvent};
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Typed access to the shared store.
///
/// Every write is best-effort: it returns a `Result` the caller is free to
/// ignore, and a missing store turns every operation into a no-op.
#[derive(Clone, Debug)]
pub struct BroadcastChannel<S: SharedStore> {
    store: Option<S>,
}

impl<S: SharedStore> BroadcastChannel<S> {
    /// Wraps `store`, which may be absent.
    pub const fn new(store: Option<S>) -> Self {
        Self { store }
    }

    /// Whether there is a store to talk to at all.
    pub const fn is_available(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> Result<&S> {
        self.store.as_ref().ok_or(Error::StoreUnavailable)
    }

    /// Encodes `value` as JSON and writes it under `key`.
    ///
    /// # Errors
    /// Fails if `value` cannot be encoded, the store rejects the write or
    /// there is no store.
    pub fn send<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.send_raw(key, &raw)
    }

    /// Writes `raw` under `key` as is.
    ///
    /// # Errors
    /// Fails if the store rejects the write or there is no store.
    pub fn send_raw(&self, key: &str, raw: &str) -> Result<()> {
        self.store()?
            .set(key, raw)
            .map_err(|e| Error::Store(e.to_string()))
    }

    /// Reads and decodes the value under `key`.
    ///
    /// Missing, unreadable and malformed values all read as `None`.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;

        match store.get(key) {
            Ok(raw) => raw.as_deref().and_then(|raw| decode(key, raw)),
            Err(e) => {
                warn!(%key, error = %e, "failed to read shared key");
                None
            }
        }
    }

    /// Reads the raw value under `key`.
    pub fn read_raw(&self, key: &str) -> Option<String> {
        let store = self.store.as_ref()?;

        store
            .get(key)
            .inspect_err(|e| warn!(%key, error = %e, "failed to read shared key"))
            .ok()
            .flatten()
    }

    /// Deletes `key`.
    ///
    /// # Errors
    /// Fails if the store rejects the removal or there is no store.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.store()?
            .remove(key)
            .map_err(|e| Error::Store(e.to_string()))
    }

    /// Lists every key of the store.
    ///
    /// # Errors
    /// Fails if the store cannot be listed or there is no store.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.store()?
            .keys()
            .map_err(|e| Error::Store(e.to_string()))
    }

    /// Streams changes made by other tabs, if there is a store.
    pub fn subscribe(&self) -> Option<BoxStream<'static, StorageEvent>> {
        self.store.as_ref().map(SharedStore::subscribe)
    }
}

/// Decodes a raw shared value, dropping it with a warning if malformed.
pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(%key, error = %e, "dropping malformed shared value");
            debug!(%key, %raw, "malformed value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use crosstab_store_memory::MemoryStore;

    #[test]
    fn test_send_and_read() {
        let channel = BroadcastChannel::new(Some(MemoryStore::new()));

        channel.send("k", &["a", "b"]).unwrap();

        assert_eq!(channel.read::<Vec<String>>("k"), Some(vec!["a".into(), "b".into()]));
        assert_eq!(channel.read_raw("k").as_deref(), Some(r#"["a","b"]"#));
        assert_eq!(channel.read::<Vec<String>>("missing"), None);
    }

    #[test]
    fn test_malformed_values_read_as_none() {
        let store = MemoryStore::new();
        store.set("k", "{not json").unwrap();
        let channel = BroadcastChannel::new(Some(store));

        assert_eq!(channel.read::<Vec<String>>("k"), None);
        assert_eq!(decode::<u64>("k", "\"text\""), None);
        assert_eq!(decode::<u64>("k", "42"), Some(42));
    }

    #[test]
    fn test_absent_store() {
        let channel = BroadcastChannel::<MemoryStore>::new(None);

        assert!(!channel.is_available());
        assert_matches!(channel.send("k", &1), Err(Error::StoreUnavailable));
        assert_matches!(channel.remove("k"), Err(Error::StoreUnavailable));
        assert_eq!(channel.read::<u64>("k"), None);
        assert!(channel.subscribe().is_none());
    }

    #[test]
    fn test_rejected_write_is_reported() {
        let store = MemoryStore::new();
        store.set_quota_exceeded(true);
        let channel = BroadcastChannel::new(Some(store));

        assert_matches!(channel.send("k", &1), Err(Error::Store(_)));
    }
}
