//! Storage boundary for character records.
//!
//! [`CharacterStore`] exposes the primitive operations the repository is built
//! on. Implementations must enforce identity-key uniqueness on insert (unless
//! explicitly constructed without it) and apply versioned writes atomically.

use async_trait::async_trait;
use charvault_core::character::{CharacterRecord, IdentityKey};
use charvault_core::stats::StatisticsSnapshot;
use charvault_core::types::{DbId, Timestamp};

use crate::error::StoreError;
use crate::models::character::{Character, CharacterFilter, SortOrder};

pub mod memory;
pub mod postgres;

pub use memory::MemoryCharacterStore;
pub use postgres::PgCharacterStore;

/// Result of an identity-keyed insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was created with this id.
    Inserted(DbId),
    /// A row with the same identity key already exists.
    Conflict(DbId),
}

/// Result of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    /// The row exists but its version moved on since it was read.
    VersionMismatch,
    /// No row with this id.
    Missing,
}

/// A parsed full-text query.
#[derive(Debug, Clone)]
pub struct TextQuery {
    /// The query as the caller typed it; used for annotation.
    pub raw: String,
    /// `&`-joined terms as produced by `build_tsquery`.
    pub tsquery: String,
    /// Case-insensitive collection restriction.
    pub collection: Option<String>,
}

/// A search match with the store's native relevance score.
#[derive(Debug, Clone)]
pub struct ScoredCharacter {
    pub character: Character,
    pub native_score: f64,
}

/// Records sharing one identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: IdentityKey,
    /// Ordered by `scraped_at` ascending, then id; the first is the keeper.
    pub ids: Vec<DbId>,
}

#[async_trait]
pub trait CharacterStore: Send + Sync {
    /// Insert `record` unless its identity key is taken.
    async fn insert(&self, record: &CharacterRecord) -> Result<InsertOutcome, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<Character>, StoreError>;

    async fn find_by_identity(&self, key: &IdentityKey) -> Result<Option<Character>, StoreError>;

    /// Overwrite every field of row `id` if its version is still
    /// `expected_version`. `scraped_at` is never changed.
    async fn replace(
        &self,
        id: DbId,
        expected_version: i64,
        record: &CharacterRecord,
    ) -> Result<ReplaceOutcome, StoreError>;

    /// Versioned update of `quality_score` and `updated_at` only.
    async fn set_quality_score(
        &self,
        id: DbId,
        expected_version: i64,
        score: f64,
        updated_at: Timestamp,
    ) -> Result<ReplaceOutcome, StoreError>;

    /// Returns `true` if a row was deleted.
    async fn delete(&self, id: DbId) -> Result<bool, StoreError>;

    /// Delete several rows; returns how many existed.
    async fn delete_many(&self, ids: &[DbId]) -> Result<u64, StoreError>;

    /// `limit = None` returns every match from `offset` on.
    async fn list(
        &self,
        filter: &CharacterFilter,
        order: SortOrder,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Character>, StoreError>;

    async fn count(&self, filter: &CharacterFilter) -> Result<i64, StoreError>;

    /// Matches ordered by native score descending, then name.
    async fn search(
        &self,
        query: &TextQuery,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ScoredCharacter>, StoreError>;

    async fn count_search(&self, query: &TextQuery) -> Result<i64, StoreError>;

    /// Up to `limit` rows with `id > after_id`, in id order.
    async fn chunk_after(&self, after_id: DbId, limit: i64) -> Result<Vec<Character>, StoreError>;

    /// Identity keys held by more than one row.
    async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError>;

    /// Raw aggregate counts. Records scraped at or after `recent_since` count
    /// as recent.
    async fn statistics(
        &self,
        recent_since: Timestamp,
        top_n: i64,
    ) -> Result<StatisticsSnapshot, StoreError>;
}
