//! Repository behaviour when the store stalls or keeps losing write races.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use charvault_core::character::{CharacterRecord, IdentityKey};
use charvault_core::pagination::PageRequest;
use charvault_core::stats::StatisticsSnapshot;
use charvault_core::types::{DbId, Timestamp};
use charvault_db::config::RepoConfig;
use charvault_db::error::{BatchSaveError, RepoError, StoreError};
use charvault_db::models::character::{Character, CharacterFilter, SortOrder};
use charvault_db::repositories::CharacterRepo;
use charvault_db::store::{
    CharacterStore, DuplicateGroup, InsertOutcome, MemoryCharacterStore, ReplaceOutcome,
    ScoredCharacter, TextQuery,
};

use common::{minimal, raw};
use serde_json::json;

// ---------------------------------------------------------------------------
// Fault-injecting store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Every call hangs forever.
    Stall,
    /// Versioned writes always report a version mismatch.
    LoseRaces,
}

struct FaultyStore {
    inner: MemoryCharacterStore,
    fault: Fault,
}

impl FaultyStore {
    fn new(fault: Fault) -> Self {
        Self {
            inner: MemoryCharacterStore::new(),
            fault,
        }
    }

    async fn gate(&self) {
        if self.fault == Fault::Stall {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl CharacterStore for FaultyStore {
    async fn insert(&self, record: &CharacterRecord) -> Result<InsertOutcome, StoreError> {
        self.gate().await;
        self.inner.insert(record).await
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Character>, StoreError> {
        self.gate().await;
        self.inner.find_by_id(id).await
    }

    async fn find_by_identity(&self, key: &IdentityKey) -> Result<Option<Character>, StoreError> {
        self.gate().await;
        self.inner.find_by_identity(key).await
    }

    async fn replace(
        &self,
        id: DbId,
        expected_version: i64,
        record: &CharacterRecord,
    ) -> Result<ReplaceOutcome, StoreError> {
        self.gate().await;
        if self.fault == Fault::LoseRaces {
            return Ok(ReplaceOutcome::VersionMismatch);
        }
        self.inner.replace(id, expected_version, record).await
    }

    async fn set_quality_score(
        &self,
        id: DbId,
        expected_version: i64,
        score: f64,
        updated_at: Timestamp,
    ) -> Result<ReplaceOutcome, StoreError> {
        self.gate().await;
        if self.fault == Fault::LoseRaces {
            return Ok(ReplaceOutcome::VersionMismatch);
        }
        self.inner
            .set_quality_score(id, expected_version, score, updated_at)
            .await
    }

    async fn delete(&self, id: DbId) -> Result<bool, StoreError> {
        self.gate().await;
        self.inner.delete(id).await
    }

    async fn delete_many(&self, ids: &[DbId]) -> Result<u64, StoreError> {
        self.gate().await;
        self.inner.delete_many(ids).await
    }

    async fn list(
        &self,
        filter: &CharacterFilter,
        order: SortOrder,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Character>, StoreError> {
        self.gate().await;
        self.inner.list(filter, order, offset, limit).await
    }

    async fn count(&self, filter: &CharacterFilter) -> Result<i64, StoreError> {
        self.gate().await;
        self.inner.count(filter).await
    }

    async fn search(
        &self,
        query: &TextQuery,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ScoredCharacter>, StoreError> {
        self.gate().await;
        self.inner.search(query, offset, limit).await
    }

    async fn count_search(&self, query: &TextQuery) -> Result<i64, StoreError> {
        self.gate().await;
        self.inner.count_search(query).await
    }

    async fn chunk_after(&self, after_id: DbId, limit: i64) -> Result<Vec<Character>, StoreError> {
        self.gate().await;
        self.inner.chunk_after(after_id, limit).await
    }

    async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError> {
        self.gate().await;
        self.inner.duplicate_groups().await
    }

    async fn statistics(
        &self,
        recent_since: Timestamp,
        top_n: i64,
    ) -> Result<StatisticsSnapshot, StoreError> {
        self.gate().await;
        self.inner.statistics(recent_since, top_n).await
    }
}

fn faulty_repo(fault: Fault) -> CharacterRepo {
    let config = RepoConfig {
        store_timeout: Duration::from_millis(50),
        max_save_attempts: 3,
        ..RepoConfig::default()
    };
    CharacterRepo::new(Arc::new(FaultyStore::new(fault)), config)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stalled_store_times_out() {
    let repo = faulty_repo(Fault::Stall);

    let err = repo.save(&minimal("Smoker", "One Piece")).await.unwrap_err();
    assert_matches!(err, RepoError::Store(StoreError::Timeout(_)));

    let err = repo.find_by_id("1").await.unwrap_err();
    assert_matches!(err, StoreError::Timeout(limit) if limit == Duration::from_millis(50));

    let err = repo
        .list_by_collection("One Piece", PageRequest::default())
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::Timeout(_));
}

#[tokio::test]
async fn malformed_id_never_reaches_the_store() {
    let repo = faulty_repo(Fault::Stall);
    assert!(repo.find_by_id("not-a-number").await.unwrap().is_none());
}

#[tokio::test]
async fn endless_merge_races_surface_as_contention() {
    let repo = faulty_repo(Fault::LoseRaces);

    let first = repo.save(&minimal("Tashigi", "One Piece")).await.unwrap();
    let err = repo.save(&minimal("Tashigi", "One Piece")).await.unwrap_err();

    assert_matches!(
        err,
        RepoError::Store(StoreError::Contention { key, attempts: 3 })
            if key == IdentityKey::new("Tashigi", "One Piece")
    );

    let stored = repo.find_by_id(&first.to_string()).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn aborted_batch_keeps_partial_report() {
    let repo = faulty_repo(Fault::LoseRaces);
    let batch = vec![
        minimal("Tashigi", "One Piece"),
        raw(json!({ "name": "Nobody" })),
        minimal("Tashigi", "One Piece"),
        minimal("Smoker", "One Piece"),
    ];

    let err = repo.save_many(&batch).await.unwrap_err();

    assert_matches!(
        &err,
        BatchSaveError { index: 2, source: StoreError::Contention { attempts: 3, .. }, .. }
    );
    assert_eq!(err.report.saved_ids.len(), 1);
    assert_eq!(err.report.failures.len(), 1);
    assert_eq!(err.report.failures[0].index, 1);
    assert!(repo.find_by_identity("Smoker", "One Piece").await.unwrap().is_none());
}

#[tokio::test]
async fn lost_score_updates_are_not_counted() {
    let store = FaultyStore::new(Fault::LoseRaces);
    let mut record = minimal_stored("Hina");
    record.quality_score = 0.9;
    store.inner.insert_unchecked(record).await;
    let repo = CharacterRepo::new(Arc::new(store), RepoConfig::default());

    assert_eq!(repo.recompute_all_quality_scores().await.unwrap(), 0);
}

fn minimal_stored(name: &str) -> CharacterRecord {
    let now = chrono::Utc::now();
    CharacterRecord {
        name: name.to_string(),
        source_collection: "One Piece".to_string(),
        description: None,
        age: None,
        gender: None,
        occupation: None,
        status: None,
        abilities: Vec::new(),
        relationships: Default::default(),
        image_urls: Vec::new(),
        local_paths: Vec::new(),
        source_url: "u".to_string(),
        scraped_at: now,
        updated_at: now,
        quality_score: 0.4,
        tags: Vec::new(),
    }
}
