//! In-memory implementation of the shared key-value store, for tests and for
//! tabs living in one process.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crosstab_store::{SharedStore, StorageEvent};
use futures::StreamExt;
use futures::future::ready;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

const EVENT_CAPACITY: usize = 1024;

/// An event on the wire, tagged with the handle that caused it. Synthetic
/// events injected through [`MemoryStore::emit`] carry no origin.
type TaggedEvent = (Option<u64>, StorageEvent);

#[derive(Debug)]
struct Shared {
    map: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<TaggedEvent>,
    next_observer: AtomicU64,
    quota_exceeded: AtomicBool,
}

/// In-memory shared store.
///
/// Clones share both the data and the observer identity. Use
/// [`MemoryStore::attach`] to get a handle for another tab: it sees the same
/// data but is notified about writes from every other handle.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    observer: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a new, empty `MemoryStore`.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                map: Mutex::new(HashMap::new()),
                events,
                next_observer: AtomicU64::new(1),
                quota_exceeded: AtomicBool::new(false),
            }),
            observer: 0,
        }
    }

    /// Returns a new handle onto the same data with its own observer identity.
    #[must_use]
    pub fn attach(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            observer: self.shared.next_observer.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Announces a change to every handle without touching the data, as a
    /// host would when replaying a notification.
    pub fn emit<K: Into<String>>(&self, key: K, new_value: Option<&str>) {
        let event = StorageEvent::new(key, new_value.map(str::to_string));
        let _ = self.shared.events.send((None, event));
    }

    /// Writes `value` without notifying anyone, as when a host drops the
    /// change notification.
    pub fn set_silently(&self, key: &str, value: &str) {
        self.shared
            .map
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    /// Makes every following write fail with [`Error::QuotaExceeded`].
    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.shared
            .quota_exceeded
            .store(exceeded, Ordering::Relaxed);
    }

    fn check_quota(&self) -> Result<(), Error> {
        if self.shared.quota_exceeded.load(Ordering::Relaxed) {
            return Err(Error::QuotaExceeded);
        }
        Ok(())
    }

    fn announce(&self, key: &str, new_value: Option<String>) {
        let event = StorageEvent::new(key, new_value);
        let _ = self.shared.events.send((Some(self.observer), event));
    }
}

impl SharedStore for MemoryStore {
    type Error = Error;

    fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self.shared.map.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Self::Error> {
        self.check_quota()?;
        self.shared
            .map
            .lock()
            .insert(key.to_string(), value.to_string());
        self.announce(key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Self::Error> {
        let removed = self.shared.map.lock().remove(key);
        if removed.is_some() {
            self.announce(key, None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self.shared.map.lock().keys().cloned().collect())
    }

    fn subscribe(&self) -> BoxStream<'static, StorageEvent> {
        let observer = self.observer;

        BroadcastStream::new(self.shared.events.subscribe())
            .filter_map(move |received| {
                ready(match received {
                    Ok((origin, event)) if origin != Some(observer) => Some(event),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(observer, error = %err, "storage notifications lagged");
                        None
                    }
                })
            })
            .boxed()
    }
}
