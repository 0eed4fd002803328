//! Abstract interface for the append-only action log that tabs replicate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod entry;

pub use entry::{Action, Entry, EntryId, LogEvent, Meta, ParseEntryIdError};

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Marker trait for `ActionLog` errors
pub trait LogError: Debug + Error + Send + Sync + 'static {}

/// An append-only log of actions with reason-counted reclamation.
///
/// Entries stay in the log for as long as they carry at least one reason.
/// Every change is published to subscribers as a [`LogEvent`].
#[async_trait]
pub trait ActionLog: Clone + Send + Sync + 'static {
    /// The error type for log operations.
    type Error: LogError;

    /// Generates a fresh identifier attributed to this log's node.
    fn generate_id(&self) -> EntryId;

    /// Appends an entry.
    ///
    /// Returns `false` without publishing anything if an entry with the same
    /// identifier is already present. An entry without reasons is published
    /// as added and immediately as cleaned, and is not retained.
    async fn add(&self, action: Action, meta: Meta) -> Result<bool, Self::Error>;

    /// Removes the entry with identifier `id`, regardless of its reasons.
    async fn remove(&self, id: &EntryId) -> Result<Option<Entry>, Self::Error>;

    /// Drops `reason` from every entry carrying it and reclaims the entries
    /// left without reasons. Returns how many entries were reclaimed.
    async fn remove_reason(&self, reason: &str) -> Result<usize, Self::Error>;

    /// Returns every retained entry, oldest first.
    async fn entries(&self) -> Result<Vec<Entry>, Self::Error>;

    /// Subscribes to changes of the log.
    fn subscribe(&self) -> BoxStream<'static, LogEvent>;

    /// Whether the log's storage is already visible to every tab, in which
    /// case replicating entries into it would duplicate them.
    fn is_shared(&self) -> bool {
        false
    }
}
