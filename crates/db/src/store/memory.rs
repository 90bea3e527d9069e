//! In-process implementation of [`CharacterStore`].
//!
//! Mirrors the PostgreSQL store's semantics closely enough to run the
//! repository test-suite without a database: identity uniqueness, versioned
//! writes, case-insensitive collection filters and an A/B/C weighted text
//! score. The text score counts exact token matches; there is no stemming.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use charvault_core::character::{CharacterRecord, IdentityKey};
use charvault_core::search::{
    tokenize, weight_value, WEIGHT_ATTRIBUTES, WEIGHT_DESCRIPTION, WEIGHT_NAME,
};
use charvault_core::stats::{
    histogram_bucket, top_counts, CountBucket, StatisticsSnapshot, HISTOGRAM_BUCKETS,
};
use charvault_core::types::{DbId, Timestamp};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::character::{Character, CharacterFilter, SortOrder};
use crate::store::{
    CharacterStore, DuplicateGroup, InsertOutcome, ReplaceOutcome, ScoredCharacter, TextQuery,
};

#[derive(Debug)]
struct State {
    next_id: DbId,
    rows: BTreeMap<DbId, Character>,
}

impl State {
    /// Earliest-scraped row holding `key`, ties broken by id.
    fn by_identity(&self, key: &IdentityKey) -> Option<&Character> {
        self.rows
            .values()
            .filter(|c| c.name == key.name && c.source_collection == key.source_collection)
            .min_by(|a, b| a.scraped_at.cmp(&b.scraped_at).then(a.id.cmp(&b.id)))
    }
}

/// Character store held entirely in memory.
#[derive(Debug)]
pub struct MemoryCharacterStore {
    state: RwLock<State>,
    enforce_identity: bool,
}

impl Default for MemoryCharacterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCharacterStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                next_id: 1,
                rows: BTreeMap::new(),
            }),
            enforce_identity: true,
        }
    }

    /// A store that accepts several rows with the same identity key, like a
    /// backend whose unique index was never created.
    pub fn without_identity_constraint() -> Self {
        Self {
            enforce_identity: false,
            ..Self::new()
        }
    }

    /// Insert `record` unconditionally, bypassing the identity check.
    /// Returns the new id.
    pub async fn insert_unchecked(&self, record: CharacterRecord) -> DbId {
        let mut state = self.state.write().await;
        let id = state.next_id;
        state.next_id += 1;
        state.rows.insert(id, Character::from_record(id, 1, record));
        id
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Weighted token-match score of `character` for every term, or `None` if a
/// term does not occur in any indexed field.
fn text_score(character: &Character, terms: &[String]) -> Option<f64> {
    let mut fields: Vec<(char, Vec<String>)> = vec![(WEIGHT_NAME, tokenize(&character.name))];
    if let Some(description) = &character.description {
        fields.push((WEIGHT_DESCRIPTION, tokenize(description)));
    }
    for ability in &character.abilities {
        fields.push((WEIGHT_ATTRIBUTES, tokenize(ability)));
    }
    if let Some(occupation) = &character.occupation {
        fields.push((WEIGHT_ATTRIBUTES, tokenize(occupation)));
    }

    let mut total = 0.0;
    for term in terms {
        let mut term_score = 0.0;
        for (class, tokens) in &fields {
            let hits = tokens.iter().filter(|t| *t == term).count();
            term_score += weight_value(*class) * hits as f64;
        }
        if term_score == 0.0 {
            return None;
        }
        total += term_score;
    }
    Some(total)
}

fn collection_matches(character: &Character, collection: Option<&str>) -> bool {
    collection.is_none_or(|c| character.source_collection.to_lowercase() == c.to_lowercase())
}

fn page<T>(items: impl Iterator<Item = T>, offset: i64, limit: Option<i64>) -> Vec<T> {
    let skipped = items.skip(usize::try_from(offset).unwrap_or(0));
    match limit {
        Some(limit) => skipped.take(usize::try_from(limit).unwrap_or(0)).collect(),
        None => skipped.collect(),
    }
}

fn versioned_outcome(row: Option<&Character>, expected_version: i64) -> Option<ReplaceOutcome> {
    match row {
        None => Some(ReplaceOutcome::Missing),
        Some(row) if row.version != expected_version => Some(ReplaceOutcome::VersionMismatch),
        Some(_) => None,
    }
}

#[async_trait]
impl CharacterStore for MemoryCharacterStore {
    async fn insert(&self, record: &CharacterRecord) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.write().await;
        if self.enforce_identity {
            if let Some(existing) = state.by_identity(&record.identity_key()) {
                return Ok(InsertOutcome::Conflict(existing.id));
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        state
            .rows
            .insert(id, Character::from_record(id, 1, record.clone()));
        Ok(InsertOutcome::Inserted(id))
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Character>, StoreError> {
        Ok(self.state.read().await.rows.get(&id).cloned())
    }

    async fn find_by_identity(&self, key: &IdentityKey) -> Result<Option<Character>, StoreError> {
        Ok(self.state.read().await.by_identity(key).cloned())
    }

    async fn replace(
        &self,
        id: DbId,
        expected_version: i64,
        record: &CharacterRecord,
    ) -> Result<ReplaceOutcome, StoreError> {
        let mut state = self.state.write().await;
        if let Some(outcome) = versioned_outcome(state.rows.get(&id), expected_version) {
            return Ok(outcome);
        }
        if self.enforce_identity {
            let key = record.identity_key();
            if state.by_identity(&key).is_some_and(|other| other.id != id) {
                return Err(StoreError::IdentityConflict(key));
            }
        }

        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(ReplaceOutcome::Missing);
        };
        let scraped_at = row.scraped_at;
        let version = row.version + 1;
        *row = Character::from_record(id, version, record.clone());
        row.scraped_at = scraped_at;
        Ok(ReplaceOutcome::Replaced)
    }

    async fn set_quality_score(
        &self,
        id: DbId,
        expected_version: i64,
        score: f64,
        updated_at: Timestamp,
    ) -> Result<ReplaceOutcome, StoreError> {
        let mut state = self.state.write().await;
        if let Some(outcome) = versioned_outcome(state.rows.get(&id), expected_version) {
            return Ok(outcome);
        }
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(ReplaceOutcome::Missing);
        };
        row.quality_score = score;
        row.updated_at = updated_at.max(row.scraped_at);
        row.version += 1;
        Ok(ReplaceOutcome::Replaced)
    }

    async fn delete(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(self.state.write().await.rows.remove(&id).is_some())
    }

    async fn delete_many(&self, ids: &[DbId]) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let removed = ids
            .iter()
            .filter(|id| state.rows.remove(*id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn list(
        &self,
        filter: &CharacterFilter,
        order: SortOrder,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Character>, StoreError> {
        let state = self.state.read().await;
        let mut matches: Vec<&Character> =
            state.rows.values().filter(|c| filter.matches(c)).collect();
        matches.sort_by(|a, b| order.compare(a, b));
        Ok(page(matches.into_iter().cloned(), offset, limit))
    }

    async fn count(&self, filter: &CharacterFilter) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state.rows.values().filter(|c| filter.matches(c)).count() as i64)
    }

    async fn search(
        &self,
        query: &TextQuery,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ScoredCharacter>, StoreError> {
        let terms = tokenize(&query.tsquery);
        let state = self.state.read().await;
        let mut hits: Vec<ScoredCharacter> = state
            .rows
            .values()
            .filter(|c| collection_matches(c, query.collection.as_deref()))
            .filter_map(|c| {
                text_score(c, &terms).map(|native_score| ScoredCharacter {
                    character: c.clone(),
                    native_score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.native_score
                .total_cmp(&a.native_score)
                .then_with(|| SortOrder::NameAsc.compare(&a.character, &b.character))
        });
        Ok(page(hits.into_iter(), offset, Some(limit)))
    }

    async fn count_search(&self, query: &TextQuery) -> Result<i64, StoreError> {
        let terms = tokenize(&query.tsquery);
        let state = self.state.read().await;
        let total = state
            .rows
            .values()
            .filter(|c| collection_matches(c, query.collection.as_deref()))
            .filter(|c| text_score(c, &terms).is_some())
            .count();
        Ok(total as i64)
    }

    async fn chunk_after(&self, after_id: DbId, limit: i64) -> Result<Vec<Character>, StoreError> {
        let state = self.state.read().await;
        Ok(page(
            state
                .rows
                .range(after_id.saturating_add(1)..)
                .map(|(_, c)| c.clone()),
            0,
            Some(limit),
        ))
    }

    async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError> {
        let state = self.state.read().await;
        let mut groups: BTreeMap<IdentityKey, Vec<&Character>> = BTreeMap::new();
        for row in state.rows.values() {
            groups.entry(row.identity_key()).or_default().push(row);
        }
        Ok(groups
            .into_iter()
            .filter(|(_, rows)| rows.len() > 1)
            .map(|(key, mut rows)| {
                rows.sort_by(|a, b| a.scraped_at.cmp(&b.scraped_at).then(a.id.cmp(&b.id)));
                DuplicateGroup {
                    key,
                    ids: rows.iter().map(|c| c.id).collect(),
                }
            })
            .collect())
    }

    async fn statistics(
        &self,
        recent_since: Timestamp,
        top_n: i64,
    ) -> Result<StatisticsSnapshot, StoreError> {
        let state = self.state.read().await;
        let rows: Vec<&Character> = state.rows.values().collect();
        let top_n = usize::try_from(top_n).unwrap_or(0);

        let mut collections: HashMap<&str, i64> = HashMap::new();
        let mut abilities: HashMap<&str, i64> = HashMap::new();
        let mut histogram_counts = [0i64; HISTOGRAM_BUCKETS];
        for row in &rows {
            *collections.entry(row.source_collection.as_str()).or_default() += 1;
            for ability in &row.abilities {
                *abilities.entry(ability.as_str()).or_default() += 1;
            }
            histogram_counts[histogram_bucket(row.quality_score)] += 1;
        }

        let to_buckets = |counts: HashMap<&str, i64>| {
            let buckets = counts
                .into_iter()
                .map(|(value, count)| CountBucket {
                    value: value.to_string(),
                    count,
                })
                .collect();
            top_counts(buckets, top_n)
        };

        let total = rows.len() as i64;
        let average_quality_score = (total > 0)
            .then(|| rows.iter().map(|c| c.quality_score).sum::<f64>() / total as f64);

        Ok(StatisticsSnapshot {
            total,
            top_collections: to_buckets(collections),
            average_quality_score,
            histogram_counts,
            recent_count: rows.iter().filter(|c| c.scraped_at >= recent_since).count() as i64,
            top_abilities: to_buckets(abilities),
            with_images: rows.iter().filter(|c| !c.image_urls.is_empty()).count() as i64,
        })
    }
}
