//! Abstract interface for the network endpoint that synchronizes the log with
//! the remote peer. Only the leading tab drives it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug};

use async_trait::async_trait;
use crosstab_log::{Action, EntryId, Meta};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Marker trait for `SyncNode` errors
pub trait NodeError: Debug + Error + Send + Sync + 'static {}

/// Connection state of a node, ordered by progress.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// No connection.
    #[default]
    Disconnected,

    /// Connection in progress.
    Connecting,

    /// Connected and authenticated.
    Connected,

    /// Connected with outgoing entries in flight.
    Sending,

    /// Connected with nothing left to send.
    Synchronized,
}

impl NodeState {
    /// Whether the state is anything beyond `connecting`.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Sending | Self::Synchronized)
    }

    /// The lowercase name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Sending => "sending",
            Self::Synchronized => "synchronized",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synchronization endpoint towards the remote peer.
#[async_trait]
pub trait SyncNode: Clone + Send + Sync + 'static {
    /// The error type for node operations.
    type Error: NodeError;

    /// Starts connecting to the remote peer.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Drops the connection to the remote peer.
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Sends a single entry to the remote peer.
    async fn transmit(&self, id: EntryId, action: Action, meta: Meta) -> Result<(), Self::Error>;

    /// The current connection state.
    fn state(&self) -> NodeState;

    /// Watches the connection state.
    fn watch_state(&self) -> watch::Receiver<NodeState>;

    /// Tears the node down for good.
    async fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_means_beyond_connecting() {
        assert!(!NodeState::Disconnected.is_connected());
        assert!(!NodeState::Connecting.is_connected());
        assert!(NodeState::Connected.is_connected());
        assert!(NodeState::Sending.is_connected());
        assert!(NodeState::Synchronized.is_connected());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&NodeState::Synchronized).unwrap(),
            "\"synchronized\""
        );
        assert_eq!(
            serde_json::from_str::<NodeState>("\"sending\"").unwrap(),
            NodeState::Sending
        );
        assert!(serde_json::from_str::<NodeState>("\"bogus\"").is_err());
        assert_eq!(NodeState::Connecting.to_string(), "connecting");
    }
}
