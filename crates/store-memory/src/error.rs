use crosstab_store::StoreError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The store refused the write because it is out of capacity.
    #[error("the quota has been exceeded")]
    QuotaExceeded,
}

impl StoreError for Error {}
