//! Mock implementation of the sync node that records every call, for tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;

use async_trait::async_trait;
use crosstab_log::{Action, EntryId, Meta};
use crosstab_node::{NodeState, SyncNode};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// An entry handed to [`SyncNode::transmit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmitted {
    /// Identifier as sent.
    pub id: EntryId,

    /// Payload as sent.
    pub action: Action,

    /// Metadata as sent.
    pub meta: Meta,
}

#[derive(Debug, Default)]
struct Calls {
    connects: usize,
    disconnects: usize,
    destroyed: bool,
    transmitted: Vec<Transmitted>,
}

/// A node that never talks to the network.
///
/// `connect` moves it to `connecting`, `disconnect` and `destroy` back to
/// `disconnected`. Anything further is driven through [`MockNode::set_state`].
#[derive(Clone, Debug)]
pub struct MockNode {
    state: Arc<watch::Sender<NodeState>>,
    calls: Arc<Mutex<Calls>>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    /// Creates a new, disconnected mock node.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(NodeState::Disconnected);

        Self {
            state: Arc::new(state),
            calls: Arc::new(Mutex::new(Calls::default())),
        }
    }

    /// Moves the node to `state`, notifying watchers.
    pub fn set_state(&self, state: NodeState) {
        self.state.send_replace(state);
    }

    /// How many times `connect` was called.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.calls.lock().connects
    }

    /// How many times `disconnect` was called.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.calls.lock().disconnects
    }

    /// Whether `destroy` was called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.calls.lock().destroyed
    }

    /// Every entry transmitted so far, in order.
    #[must_use]
    pub fn transmitted(&self) -> Vec<Transmitted> {
        self.calls.lock().transmitted.clone()
    }
}

#[async_trait]
impl SyncNode for MockNode {
    type Error = Error;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.calls.lock().connects += 1;
        self.set_state(NodeState::Connecting);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.calls.lock().disconnects += 1;
        self.set_state(NodeState::Disconnected);
        Ok(())
    }

    async fn transmit(&self, id: EntryId, action: Action, meta: Meta) -> Result<(), Self::Error> {
        if self.calls.lock().destroyed {
            return Err(Error::Destroyed);
        }

        debug!(%id, "mock node transmitting entry");
        self.calls
            .lock()
            .transmitted
            .push(Transmitted { id, action, meta });
        Ok(())
    }

    fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    async fn destroy(&self) {
        self.calls.lock().destroyed = true;
        self.set_state(NodeState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[tokio::test]
    async fn test_connect_and_disconnect_move_state() {
        let node = MockNode::new();
        let mut watcher = node.watch_state();

        node.connect().await.unwrap();
        assert_eq!(node.state(), NodeState::Connecting);
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), NodeState::Connecting);

        node.set_state(NodeState::Synchronized);
        assert_eq!(*watcher.borrow_and_update(), NodeState::Synchronized);

        node.disconnect().await.unwrap();
        assert_eq!(node.state(), NodeState::Disconnected);
        assert_eq!((node.connects(), node.disconnects()), (1, 1));
    }

    #[tokio::test]
    async fn test_transmit_records_entries() {
        let node = MockNode::new();
        let id = EntryId::new(1, "10:other", 0);

        node.transmit(id.clone(), json!({ "type": "A" }), Meta::new(id.clone()))
            .await
            .unwrap();

        let sent = node.transmitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, id);

        node.destroy().await;
        assert!(node.is_destroyed());
        assert!(
            node.transmit(id.clone(), json!({}), Meta::new(id))
                .await
                .is_err()
        );
    }
}
