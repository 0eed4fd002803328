use crosstab_log::LogError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
#[error("log error")]
pub struct Error;

impl LogError for Error {}
