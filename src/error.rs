use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the controller. Validation and not-found errors are
/// recoverable and surfaced as rejected operations; process failures stay
/// behind the supervisor boundary as boolean results.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unsupported protocol: {0}")]
    Unsupported(String),

    #[error("invalid share link: {0}")]
    Link(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("subscription fetch failed: {0}")]
    Fetch(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(detail: impl Into<String>) -> Self {
        Error::Validation(detail.into())
    }
}
