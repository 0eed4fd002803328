//! Abstract interface for the key-value store shared by every tab.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use futures::stream::BoxStream;

/// Marker trait for `SharedStore` errors
pub trait StoreError: Debug + Error + Send + Sync + 'static {}

/// A change to a single key, as seen by an observer that did not make it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    /// The key that changed.
    pub key: String,

    /// The new raw value, or `None` if the key was removed.
    pub new_value: Option<String>,
}

impl StorageEvent {
    /// Creates a new `StorageEvent`.
    pub fn new<K: Into<String>>(key: K, new_value: Option<String>) -> Self {
        Self {
            key: key.into(),
            new_value,
        }
    }
}

/// A trait representing a key-value store shared between independent tabs.
///
/// Reads and writes are synchronous. Every successful write is announced
/// asynchronously to the *other* handles of the store, never to the handle
/// that performed it.
///
/// # Required Methods
/// - `fn get(&self, key: &str)`: Retrieves the raw value stored under a key.
/// - `fn set(&self, key: &str, value: &str)`: Stores a raw value under a key.
/// - `fn remove(&self, key: &str)`: Deletes a key.
/// - `fn keys(&self)`: Lists every key currently present.
/// - `fn subscribe(&self)`: Streams changes made through other handles.
pub trait SharedStore: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: StoreError;

    /// Retrieves the raw value stored under `key`.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if the backend rejects the write (for example when
    /// its capacity is exhausted).
    fn set(&self, key: &str, value: &str) -> Result<(), Self::Error>;

    /// Deletes `key`. Deleting a missing key is not an error.
    ///
    /// # Errors
    /// Returns an error if the backend rejects the removal.
    fn remove(&self, key: &str) -> Result<(), Self::Error>;

    /// Lists every key currently present.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be enumerated.
    fn keys(&self) -> Result<Vec<String>, Self::Error>;

    /// Subscribes to changes made through other handles of this store.
    fn subscribe(&self) -> BoxStream<'static, StorageEvent>;
}
