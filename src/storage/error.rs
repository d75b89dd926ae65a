//! Error types for config store operations

use crate::error::ValidationError;
use crate::model::GroupKey;

/// Result type alias for config store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no configuration stored for {0}")]
    NotFound(GroupKey),

    /// A stored row no longer forms a valid group key
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to connect to config store: {0}")]
    ConnectionFailed(String),

    #[error("config store query failed: {0}")]
    QueryFailed(String),

    #[error("database migration failed: {0}")]
    MigrationFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StoreError::Io(io_err),
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}
