use crosstab_node::NodeError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The node was destroyed.
    #[error("node destroyed")]
    Destroyed,
}

impl NodeError for Error {}
