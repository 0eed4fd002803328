//! In-memory implementation of the action log for local development and
//! tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use crosstab_log::{Action, ActionLog, Entry, EntryId, LogEvent, Meta};
use futures::StreamExt;
use futures::future::ready;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Inner {
    entries: Mutex<Vec<Entry>>,
    events: broadcast::Sender<LogEvent>,
    node: String,
    seq: AtomicU64,
    shared: bool,
}

/// In-memory action log.
#[derive(Clone, Debug)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

impl MemoryLog {
    /// Creates a new, empty log owned by `node`.
    #[must_use]
    pub fn new<N: Into<String>>(node: N) -> Self {
        Self::build(node.into(), false)
    }

    /// Creates a log that reports itself as shared between tabs, the way a
    /// persistent browser database would be.
    #[must_use]
    pub fn shared<N: Into<String>>(node: N) -> Self {
        Self::build(node.into(), true)
    }

    fn build(node: String, shared: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                events,
                node,
                seq: AtomicU64::new(0),
                shared,
            }),
        }
    }

    /// Payloads of every retained entry, oldest first.
    #[must_use]
    pub fn actions(&self) -> Vec<Action> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|entry| entry.action.clone())
            .collect()
    }

    fn publish(&self, event: LogEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

#[async_trait]
impl ActionLog for MemoryLog {
    type Error = Error;

    fn generate_id(&self) -> EntryId {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        EntryId::new(now_millis(), self.inner.node.clone(), seq)
    }

    async fn add(&self, action: Action, meta: Meta) -> Result<bool, Self::Error> {
        let entry = Entry::new(action, meta);

        {
            let mut entries = self.inner.entries.lock();
            if entries.iter().any(|e| e.meta.id == entry.meta.id) {
                debug!(id = %entry.meta.id, "ignoring duplicate entry");
                return Ok(false);
            }
            if !entry.meta.reasons.is_empty() {
                entries.push(entry.clone());
            }
        }

        let retained = !entry.meta.reasons.is_empty();
        self.publish(LogEvent::Added(entry.clone()));
        if !retained {
            self.publish(LogEvent::Cleaned(entry));
        }

        Ok(true)
    }

    async fn remove(&self, id: &EntryId) -> Result<Option<Entry>, Self::Error> {
        let removed = {
            let mut entries = self.inner.entries.lock();
            entries
                .iter()
                .position(|e| &e.meta.id == id)
                .map(|index| entries.remove(index))
        };

        if let Some(entry) = &removed {
            self.publish(LogEvent::Cleaned(entry.clone()));
        }

        Ok(removed)
    }

    async fn remove_reason(&self, reason: &str) -> Result<usize, Self::Error> {
        let reclaimed = {
            let mut entries = self.inner.entries.lock();
            for entry in entries.iter_mut() {
                entry.meta.reasons.retain(|r| r != reason);
            }

            let (dead, alive): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|entry| entry.meta.reasons.is_empty());
            *entries = alive;
            dead
        };

        let count = reclaimed.len();
        for entry in reclaimed {
            self.publish(LogEvent::Cleaned(entry));
        }

        Ok(count)
    }

    async fn entries(&self) -> Result<Vec<Entry>, Self::Error> {
        Ok(self.inner.entries.lock().clone())
    }

    fn subscribe(&self) -> BoxStream<'static, LogEvent> {
        BroadcastStream::new(self.inner.events.subscribe())
            .filter_map(|received| {
                ready(match received {
                    Ok(event) => Some(event),
                    Err(err) => {
                        warn!(error = %err, "log notifications lagged");
                        None
                    }
                })
            })
            .boxed()
    }

    fn is_shared(&self) -> bool {
        self.inner.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn meta(log: &MemoryLog) -> Meta {
        Meta::new(log.generate_id())
    }

    #[tokio::test]
    async fn test_entry_without_reasons_is_not_retained() {
        let log = MemoryLog::new("10:a");
        let mut events = log.subscribe();

        let m = meta(&log);
        assert!(log.add(json!({ "type": "A" }), m.clone()).await.unwrap());

        let added = events.next().await.unwrap();
        let cleaned = events.next().await.unwrap();

        assert_eq!(added, LogEvent::Added(Entry::new(json!({ "type": "A" }), m.clone())));
        assert_eq!(cleaned, LogEvent::Cleaned(Entry::new(json!({ "type": "A" }), m)));
        assert!(log.actions().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_ignored() {
        let log = MemoryLog::new("10:a");
        let m = meta(&log).with_reason("keep");

        assert!(log.add(json!({ "type": "A" }), m.clone()).await.unwrap());
        assert!(!log.add(json!({ "type": "B" }), m).await.unwrap());

        assert_eq!(log.actions(), vec![json!({ "type": "A" })]);
    }

    #[tokio::test]
    async fn test_remove() {
        let log = MemoryLog::new("10:a");
        let m = meta(&log).with_reason("keep");
        log.add(json!({ "type": "A" }), m.clone()).await.unwrap();

        let mut events = log.subscribe();
        let removed = log.remove(&m.id).await.unwrap();

        assert_eq!(removed.map(|e| e.action), Some(json!({ "type": "A" })));
        assert!(matches!(events.next().await, Some(LogEvent::Cleaned(_))));
        assert!(log.remove(&m.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_reason_reclaims_only_orphans() {
        let log = MemoryLog::new("10:a");
        log.add(json!({ "type": "A" }), meta(&log).with_reason("tab1"))
            .await
            .unwrap();
        log.add(
            json!({ "type": "B" }),
            meta(&log).with_reason("tab1").with_reason("other"),
        )
        .await
        .unwrap();
        log.add(json!({ "type": "C" }), meta(&log).with_reason("tab2"))
            .await
            .unwrap();

        let reclaimed = log.remove_reason("tab1").await.unwrap();

        assert_eq!(reclaimed, 1);
        assert_eq!(log.actions(), vec![json!({ "type": "B" }), json!({ "type": "C" })]);
        let entries = log.entries().await.unwrap();
        assert_eq!(entries[0].meta.reasons, vec!["other".to_string()]);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let log = MemoryLog::new("10:a");

        let first = log.generate_id();
        let second = log.generate_id();

        assert_ne!(first, second);
        assert_eq!(first.node, "10:a");
        assert!(!log.is_shared());
        assert!(MemoryLog::shared("10:a").is_shared());
    }
}
