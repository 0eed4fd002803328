use thiserror::Error;

/// Errors that can occur in this crate.
///
/// None of them ever escape the public API of the client: they describe
/// best-effort operations whose failure the client absorbs and logs.
#[derive(Debug, Error)]
pub enum Error {
    /// Encoding or decoding a shared record failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The shared store rejected an operation.
    #[error("shared store error: {0}")]
    Store(String),

    /// There is no shared store to talk to.
    #[error("shared store unavailable")]
    StoreUnavailable,
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
