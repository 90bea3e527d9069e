//! Repository for character records: save-with-merge, lookups, listings,
//! search and batch maintenance.

use std::future::Future;
use std::sync::Arc;

use charvault_core::character::{
    CharacterRecord, IdentityKey, RawCharacter, FIELD_LOCAL_PATHS_ALIASES,
    FIELD_QUALITY_SCORE_ALIASES, FIELD_SOURCE_COLLECTION_ALIASES, FIELD_TAGS_ALIASES,
};
use charvault_core::merge::merge;
use charvault_core::normalize::{normalize, NormalizedCharacter};
use charvault_core::pagination::{Page, PageRequest};
use charvault_core::quality::{self, score_changed};
use charvault_core::search::{annotate, build_tsquery, normalize_relevance};
use charvault_core::stats::{CharacterStatistics, RECENT_WINDOW_DAYS, TOP_N};
use charvault_core::types::{parse_db_id, DbId};
use chrono::{Duration, Utc};

use crate::config::RepoConfig;
use crate::error::{BatchSaveError, RepoError, StoreError};
use crate::models::character::{
    BatchFailure, BatchSaveReport, Character, CharacterFilter, SearchHit, SortOrder, TagFilter,
};
use crate::store::{CharacterStore, InsertOutcome, ReplaceOutcome, TextQuery};

/// Entry point for every character operation.
///
/// Holds an explicit store handle; cloning is cheap and clones share the store.
#[derive(Clone)]
pub struct CharacterRepo {
    store: Arc<dyn CharacterStore>,
    config: RepoConfig,
}

impl CharacterRepo {
    pub fn new(store: Arc<dyn CharacterStore>, config: RepoConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Run one store round-trip under the configured timeout.
    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.config.store_timeout;
        tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| StoreError::Timeout(limit))?
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Normalize `raw` and store it, merging into the existing record when
    /// the identity key is already taken.
    ///
    /// Returns the id of the created or merged record. Nothing is written if
    /// normalization fails.
    pub async fn save(&self, raw: &RawCharacter) -> Result<DbId, RepoError> {
        let normalized = normalize(raw, Utc::now())?;
        log_supplied_score(&normalized);
        Ok(self.save_record(normalized.record).await?)
    }

    /// Save several raw records. Items that fail normalization are reported
    /// and skipped; a store failure aborts the batch, and the error carries
    /// the report of everything handled before it.
    pub async fn save_many(
        &self,
        raws: &[RawCharacter],
    ) -> Result<BatchSaveReport, BatchSaveError> {
        let mut report = BatchSaveReport::default();
        for (index, raw) in raws.iter().enumerate() {
            match normalize(raw, Utc::now()) {
                Ok(normalized) => {
                    log_supplied_score(&normalized);
                    match self.save_record(normalized.record).await {
                        Ok(id) => report.saved_ids.push(id),
                        Err(source) => {
                            tracing::error!(
                                index,
                                saved = report.saved_ids.len(),
                                error = %source,
                                "Batch save aborted",
                            );
                            return Err(BatchSaveError {
                                index,
                                report,
                                source,
                            });
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "Skipping invalid character in batch");
                    report.failures.push(BatchFailure {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            saved = report.saved_ids.len(),
            failed = report.failures.len(),
            "Batch save finished",
        );
        Ok(report)
    }

    async fn save_record(&self, record: CharacterRecord) -> Result<DbId, StoreError> {
        let attempts = self.config.max_save_attempts;

        for attempt in 1..=attempts {
            let existing_id = match self.bounded(self.store.insert(&record)).await? {
                InsertOutcome::Inserted(id) => {
                    tracing::info!(
                        character_id = id,
                        name = %record.name,
                        source_collection = %record.source_collection,
                        "Created character",
                    );
                    return Ok(id);
                }
                InsertOutcome::Conflict(id) => id,
            };

            // Deleted between the insert and this read; the next insert may win.
            let Some(existing) = self.bounded(self.store.find_by_id(existing_id)).await? else {
                tracing::debug!(character_id = existing_id, attempt, "Conflicting character vanished");
                continue;
            };

            let merged = merge(&existing.to_record(), &record, Utc::now());
            match self
                .bounded(self.store.replace(existing.id, existing.version, &merged))
                .await?
            {
                ReplaceOutcome::Replaced => {
                    tracing::info!(
                        character_id = existing.id,
                        name = %merged.name,
                        source_collection = %merged.source_collection,
                        quality_score = merged.quality_score,
                        "Merged character",
                    );
                    return Ok(existing.id);
                }
                ReplaceOutcome::VersionMismatch | ReplaceOutcome::Missing => {
                    tracing::debug!(
                        character_id = existing.id,
                        attempt,
                        "Character changed during merge, retrying",
                    );
                }
            }
        }

        let key = record.identity_key();
        tracing::warn!(
            name = %key.name,
            source_collection = %key.source_collection,
            attempts,
            "Gave up saving contended character",
        );
        Err(StoreError::Contention { key, attempts })
    }

    /// Overlay `partial` onto the stored record and re-validate.
    ///
    /// Returns `false` without writing when the id is unknown or malformed,
    /// when the result fails validation, or when it would take another
    /// record's identity key. `scraped_at` is preserved.
    pub async fn update(&self, id: &str, partial: &RawCharacter) -> Result<bool, StoreError> {
        let Some(id) = parse_db_id(id) else {
            return Ok(false);
        };

        for _ in 0..self.config.max_save_attempts {
            let Some(existing) = self.bounded(self.store.find_by_id(id)).await? else {
                return Ok(false);
            };

            let mut raw = existing
                .to_record()
                .to_raw()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            overlay(&mut raw, partial);

            let now = Utc::now();
            let mut record = match normalize(&raw, now) {
                Ok(normalized) => normalized.record,
                Err(e) => {
                    tracing::warn!(character_id = id, error = %e, "Rejected character update");
                    return Ok(false);
                }
            };
            record.scraped_at = existing.scraped_at;
            record.updated_at = now.max(existing.scraped_at);

            match self
                .bounded(self.store.replace(id, existing.version, &record))
                .await
            {
                Ok(ReplaceOutcome::Replaced) => {
                    tracing::info!(character_id = id, "Updated character");
                    return Ok(true);
                }
                Ok(ReplaceOutcome::Missing) => return Ok(false),
                Ok(ReplaceOutcome::VersionMismatch) => continue,
                Err(StoreError::IdentityConflict(key)) => {
                    tracing::warn!(
                        character_id = id,
                        identity = %key,
                        "Rejected character update: identity already taken",
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Contention {
            key: self.identity_of(id).await?,
            attempts: self.config.max_save_attempts,
        })
    }

    /// Add a free-form tag. Returns `false` if the record is unknown or
    /// already carries the tag (ignoring case).
    pub async fn add_tag(&self, id: &str, tag: &str) -> Result<bool, StoreError> {
        let Some(id) = parse_db_id(id) else {
            return Ok(false);
        };

        for _ in 0..self.config.max_save_attempts {
            let Some(existing) = self.bounded(self.store.find_by_id(id)).await? else {
                return Ok(false);
            };
            let mut record = existing.to_record();
            if !record.add_tag(tag) {
                return Ok(false);
            }
            record.updated_at = Utc::now().max(record.scraped_at);
            record.refresh_quality_score();

            match self
                .bounded(self.store.replace(id, existing.version, &record))
                .await?
            {
                ReplaceOutcome::Replaced => {
                    tracing::info!(character_id = id, tag, "Tagged character");
                    return Ok(true);
                }
                ReplaceOutcome::Missing => return Ok(false),
                ReplaceOutcome::VersionMismatch => continue,
            }
        }

        Err(StoreError::Contention {
            key: self.identity_of(id).await?,
            attempts: self.config.max_save_attempts,
        })
    }

    /// Delete a record. Returns `true` if it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let Some(id) = parse_db_id(id) else {
            return Ok(false);
        };
        let deleted = self.bounded(self.store.delete(id)).await?;
        if deleted {
            tracing::info!(character_id = id, "Deleted character");
        }
        Ok(deleted)
    }

    async fn identity_of(&self, id: DbId) -> Result<IdentityKey, StoreError> {
        Ok(self
            .bounded(self.store.find_by_id(id))
            .await?
            .map(|c| c.identity_key())
            .unwrap_or_else(|| IdentityKey::new(id.to_string(), String::new())))
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Find a record by id. Malformed ids resolve to `None`.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Character>, StoreError> {
        let Some(id) = parse_db_id(id) else {
            tracing::debug!(id, "Malformed character id");
            return Ok(None);
        };
        self.bounded(self.store.find_by_id(id)).await
    }

    /// Exact-match lookup on the identity key.
    pub async fn find_by_identity(
        &self,
        name: &str,
        source_collection: &str,
    ) -> Result<Option<Character>, StoreError> {
        let key = IdentityKey::new(name, source_collection);
        self.bounded(self.store.find_by_identity(&key)).await
    }

    async fn list_page(
        &self,
        filter: CharacterFilter,
        order: SortOrder,
        page: PageRequest,
    ) -> Result<Page<Character>, StoreError> {
        let page = page.clamped(self.config.max_page_size);
        let total = self.bounded(self.store.count(&filter)).await?;
        let items = self
            .bounded(
                self.store
                    .list(&filter, order, page.offset(), Some(page.limit())),
            )
            .await?;
        Ok(Page::new(items, total, page))
    }

    /// Records of one collection (case-insensitive), name ascending.
    pub async fn list_by_collection(
        &self,
        collection: &str,
        page: PageRequest,
    ) -> Result<Page<Character>, StoreError> {
        self.list_page(CharacterFilter::collection(collection), SortOrder::NameAsc, page)
            .await
    }

    /// Records with `min <= quality_score <= max`, best first.
    /// Non-finite or inverted bounds match nothing.
    pub async fn list_by_quality(
        &self,
        min: f64,
        max: f64,
        page: PageRequest,
    ) -> Result<Page<Character>, StoreError> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Ok(Page::empty(page.clamped(self.config.max_page_size)));
        }
        let filter = CharacterFilter {
            min_quality: Some(min),
            max_quality: Some(max),
            ..CharacterFilter::default()
        };
        self.list_page(filter, SortOrder::QualityDesc, page).await
    }

    /// Records carrying all (`match_all`) or any of `tags`, name ascending.
    /// Tags match ignoring case. An empty tag list matches nothing.
    pub async fn list_by_tags(
        &self,
        tags: &[String],
        match_all: bool,
        page: PageRequest,
    ) -> Result<Page<Character>, StoreError> {
        let page = page.clamped(self.config.max_page_size);
        if tags.is_empty() {
            return Ok(Page::empty(page));
        }
        let filter = CharacterFilter {
            tags: Some(TagFilter {
                tags: tags.to_vec(),
                match_all,
            }),
            ..CharacterFilter::default()
        };
        self.list_page(filter, SortOrder::NameAsc, page).await
    }

    /// Ranked full-text search over name, description, abilities and
    /// occupation, optionally restricted to one collection.
    ///
    /// A query without usable terms yields an empty page.
    pub async fn search(
        &self,
        query: &str,
        collection: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<SearchHit>, StoreError> {
        let page = page.clamped(self.config.max_page_size);
        let Some(tsquery) = build_tsquery(query) else {
            return Ok(Page::empty(page));
        };
        let text_query = TextQuery {
            raw: query.to_string(),
            tsquery,
            collection: collection.map(str::to_string),
        };

        let total = self.bounded(self.store.count_search(&text_query)).await?;
        let scored = self
            .bounded(
                self.store
                    .search(&text_query, page.offset(), page.limit()),
            )
            .await?;
        tracing::debug!(query, hits = scored.len(), total, "Character search");

        let hits = scored
            .into_iter()
            .map(|hit| {
                let annotations = annotate(&hit.character.to_record(), &text_query.raw);
                SearchHit {
                    relevance_score: normalize_relevance(hit.native_score),
                    matched_fields: annotations.matched_fields,
                    highlights: annotations.highlights,
                    character: hit.character,
                }
            })
            .collect();
        Ok(Page::new(hits, total, page))
    }

    /// Every record, optionally restricted to one collection, with
    /// `quality_score >= min_quality`; ordered by collection then name.
    pub async fn export(
        &self,
        collection: Option<&str>,
        min_quality: f64,
    ) -> Result<Vec<Character>, StoreError> {
        let filter = CharacterFilter {
            collection: collection.map(str::to_string),
            min_quality: Some(min_quality),
            ..CharacterFilter::default()
        };
        self.bounded(
            self.store
                .list(&filter, SortOrder::CollectionThenName, 0, None),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Recompute every stored quality score, writing only those that changed.
    ///
    /// Walks the table in id-ordered chunks of `batch_chunk_size`. Returns the
    /// number of records updated; a second run right after returns 0.
    pub async fn recompute_all_quality_scores(&self) -> Result<u64, StoreError> {
        let chunk_size = self.config.batch_chunk_size;
        let mut after_id: DbId = 0;
        let mut chunk: u64 = 0;
        let mut updated: u64 = 0;

        loop {
            let rows = self
                .bounded(self.store.chunk_after(after_id, chunk_size))
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            after_id = last.id;
            chunk += 1;

            let mut chunk_updated: u64 = 0;
            for row in &rows {
                let computed = quality::score(&row.to_record());
                if !score_changed(row.quality_score, computed) {
                    continue;
                }
                match self
                    .bounded(
                        self.store
                            .set_quality_score(row.id, row.version, computed, Utc::now()),
                    )
                    .await?
                {
                    ReplaceOutcome::Replaced => chunk_updated += 1,
                    // A concurrent write already stored a freshly computed score.
                    ReplaceOutcome::VersionMismatch | ReplaceOutcome::Missing => {
                        tracing::debug!(character_id = row.id, "Skipped concurrently modified character");
                    }
                }
            }

            tracing::info!(chunk, scanned = rows.len(), updated = chunk_updated, "Recomputed quality scores");
            updated += chunk_updated;

            if (rows.len() as i64) < chunk_size {
                break;
            }
        }

        tracing::info!(updated, "Quality score recomputation finished");
        Ok(updated)
    }

    /// Remove all but the earliest-scraped record of each identity key.
    /// Returns the number of records removed.
    pub async fn cleanup_duplicates(&self) -> Result<u64, StoreError> {
        let groups = self.bounded(self.store.duplicate_groups()).await?;

        let mut removed: u64 = 0;
        for group in &groups {
            let Some((keep, extra)) = group.ids.split_first() else {
                continue;
            };
            let deleted = self.bounded(self.store.delete_many(extra)).await?;
            tracing::info!(
                name = %group.key.name,
                source_collection = %group.key.source_collection,
                kept = *keep,
                removed = deleted,
                "Removed duplicate characters",
            );
            removed += deleted;
        }

        tracing::info!(groups = groups.len(), removed, "Duplicate cleanup finished");
        Ok(removed)
    }

    /// Collection-wide summary.
    pub async fn statistics(&self) -> Result<CharacterStatistics, StoreError> {
        let recent_since = Utc::now() - Duration::days(RECENT_WINDOW_DAYS);
        let snapshot = self
            .bounded(self.store.statistics(recent_since, TOP_N))
            .await?;
        Ok(CharacterStatistics::from(snapshot))
    }
}

/// Field keys that name the same attribute.
const ALIAS_GROUPS: &[&[&str]] = &[
    FIELD_SOURCE_COLLECTION_ALIASES,
    FIELD_LOCAL_PATHS_ALIASES,
    FIELD_QUALITY_SCORE_ALIASES,
    FIELD_TAGS_ALIASES,
];

/// Apply `partial` on top of `raw`. A partial field given under an alias
/// replaces the stored value under any of its names.
fn overlay(raw: &mut RawCharacter, partial: &RawCharacter) {
    for group in ALIAS_GROUPS {
        if group.iter().any(|key| partial.contains_key(*key)) {
            for key in *group {
                raw.remove(*key);
            }
        }
    }
    raw.extend(partial.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn log_supplied_score(normalized: &NormalizedCharacter) {
    if let Some(supplied) = normalized.supplied_quality_score {
        if score_changed(supplied, normalized.record.quality_score) {
            tracing::debug!(
                name = %normalized.record.name,
                supplied,
                computed = normalized.record.quality_score,
                "Ignoring supplied quality score",
            );
        }
    }
}
