//! Errors surfaced by the service layer, one variant per client-visible kind.

use thiserror::Error;

use crate::lifecycle::SessionError;
use crate::translate::TranslatedError;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request itself is malformed.
    #[error("{0}")]
    Validation(String),
    /// The metadata probe failed.
    #[error("{}: {}", .0.error, .0.detail)]
    Extraction(TranslatedError),
    /// The tool failed while downloading.
    #[error("{}: {}", .0.error, .0.detail)]
    Download(TranslatedError),
    /// The tool reported success but produced no file.
    #[error("download finished without producing a file")]
    Integrity,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {err}"))
    }
}
