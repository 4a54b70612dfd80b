//! Persistent stores for NimbusFS.
//!
//! Two physical stores live under the per-mount cache directory:
//!
//! - `metadata.db` — a SQLite database holding the inode records, the
//!   offline-change log, upload-session checkpoints, and small
//!   key/value state (delta link, config blob). All writes go through
//!   short transactions.
//! - `content/` — the body store: one file per inode id in a two-level
//!   sharded layout. Body presence is independent of metadata.

pub mod body;
pub mod metadata;
pub mod pool;

pub use body::BodyStore;
pub use metadata::MetadataStore;
pub use pool::DatabasePool;

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database query failed: {0}")]
    Query(String),

    #[error("Record serialization failed: {0}")]
    Serialization(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}
