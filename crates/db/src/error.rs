use std::time::Duration;

use charvault_core::character::IdentityKey;
use charvault_core::error::CoreError;

use crate::models::character::BatchSaveReport;

/// Name of the identity-key uniqueness constraint in the `characters` table.
pub const IDENTITY_CONSTRAINT: &str = "uq_characters_identity";

/// PostgreSQL SQLSTATE for unique constraint violations.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Failure of the underlying store. Never leaves a partial write behind.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A write would give two records the same identity key.
    #[error("Another character already uses identity {0}")]
    IdentityConflict(IdentityKey),

    /// Concurrent writers kept invalidating the merge for one identity key.
    #[error("Gave up saving {key} after {attempts} conflicting attempts")]
    Contention { key: IdentityKey, attempts: u32 },

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Turn a unique violation on the identity constraint into
    /// [`StoreError::IdentityConflict`]; pass everything else through.
    pub fn classify(err: sqlx::Error, key: &IdentityKey) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION)
                && db_err.constraint() == Some(IDENTITY_CONSTRAINT)
            {
                return Self::IdentityConflict(key.clone());
            }
        }
        Self::Database(err)
    }
}

/// Error type for repository operations that validate input.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The raw input failed normalization; nothing was written.
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Store failure that stopped a batch save partway through.
#[derive(Debug, thiserror::Error)]
#[error("Batch save aborted at item {index}: {source}")]
pub struct BatchSaveError {
    /// Position of the item whose save failed.
    pub index: usize,
    /// Items saved or rejected before the failure.
    pub report: BatchSaveReport,
    #[source]
    pub source: StoreError,
}
