use docshift_core::{ApiErrorClass, LibraryError};
use thiserror::Error;

use super::paths::PathError;
use super::throttle::ThrottleError;
use super::transfer::TransferError;
use crate::storage::StoreError;
use crate::token_provider::TokenCacheError;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] PathError),
    #[error("invalid argument: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Api(#[from] ThrottleError<LibraryError>),
    #[error(transparent)]
    Transfer(#[from] ThrottleError<TransferError>),
    #[error("{path} already exists at the destination")]
    Conflict { path: String },
    #[error("crawl failed: {0}")]
    Crawl(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("bulk copy job {job_id} failed: {reason}")]
    BulkJob { job_id: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] TokenCacheError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl MigrationError {
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            MigrationError::InvalidArgument(_) | MigrationError::InvalidRequest(_)
        )
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        self.library_error().and_then(LibraryError::classification)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MigrationError::Conflict { .. })
            || self.library_error().is_some_and(LibraryError::is_conflict)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, MigrationError::Auth(_))
            || self.classification() == Some(ApiErrorClass::Auth)
    }

    fn library_error(&self) -> Option<&LibraryError> {
        match self {
            MigrationError::Api(err) => Some(err.inner()),
            MigrationError::Transfer(err) => match err.inner() {
                TransferError::Api(inner) => Some(inner),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<LibraryError> for MigrationError {
    fn from(err: LibraryError) -> Self {
        MigrationError::Api(ThrottleError::Failed(err))
    }
}
