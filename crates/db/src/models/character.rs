//! Character entity model and query DTOs.

use std::collections::BTreeMap;

use charvault_core::character::{contains_case_insensitive, CharacterRecord, IdentityKey};
use charvault_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `characters` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Character {
    pub id: DbId,
    pub name: String,
    pub source_collection: String,
    pub description: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub occupation: Option<String>,
    pub status: Option<String>,
    pub abilities: Vec<String>,
    /// NOT NULL in the database; defaults to `{}`.
    pub relationships: Json<BTreeMap<String, String>>,
    pub image_urls: Vec<String>,
    pub local_paths: Vec<String>,
    pub source_url: String,
    pub quality_score: f64,
    pub tags: Vec<String>,
    /// Bumped on every write; used for optimistic concurrency.
    pub version: i64,
    pub scraped_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Character {
    pub fn from_record(id: DbId, version: i64, record: CharacterRecord) -> Self {
        Self {
            id,
            name: record.name,
            source_collection: record.source_collection,
            description: record.description,
            age: record.age,
            gender: record.gender,
            occupation: record.occupation,
            status: record.status,
            abilities: record.abilities,
            relationships: Json(record.relationships),
            image_urls: record.image_urls,
            local_paths: record.local_paths,
            source_url: record.source_url,
            quality_score: record.quality_score,
            tags: record.tags,
            version,
            scraped_at: record.scraped_at,
            updated_at: record.updated_at,
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.name.clone(), self.source_collection.clone())
    }

    /// The storage-independent record view of this row.
    pub fn to_record(&self) -> CharacterRecord {
        self.clone().into_record()
    }

    pub fn into_record(self) -> CharacterRecord {
        CharacterRecord {
            name: self.name,
            source_collection: self.source_collection,
            description: self.description,
            age: self.age,
            gender: self.gender,
            occupation: self.occupation,
            status: self.status,
            abilities: self.abilities,
            relationships: self.relationships.0,
            image_urls: self.image_urls,
            local_paths: self.local_paths,
            source_url: self.source_url,
            scraped_at: self.scraped_at,
            updated_at: self.updated_at,
            quality_score: self.quality_score,
            tags: self.tags,
        }
    }
}

/// A ranked full-text search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub character: Character,
    /// Native text score mapped onto `[0, 1]`.
    pub relevance_score: f64,
    /// Indexed fields containing the whole query (case-insensitive).
    pub matched_fields: Vec<String>,
    /// Field name to a snippet with the match wrapped in `**`.
    pub highlights: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Query DTOs
// ---------------------------------------------------------------------------

/// Tag constraint for list queries. Tags are compared ignoring case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub tags: Vec<String>,
    /// `true`: record must carry every tag. `false`: at least one.
    pub match_all: bool,
}

/// Optional filters for list/count queries. `None` fields are not applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterFilter {
    /// Compared case-insensitively.
    pub collection: Option<String>,
    /// Inclusive lower bound.
    pub min_quality: Option<f64>,
    /// Inclusive upper bound.
    pub max_quality: Option<f64>,
    pub tags: Option<TagFilter>,
}

impl CharacterFilter {
    pub fn collection(collection: &str) -> Self {
        Self {
            collection: Some(collection.to_string()),
            ..Self::default()
        }
    }

    /// Whether `character` passes every populated filter.
    pub fn matches(&self, character: &Character) -> bool {
        if let Some(collection) = &self.collection {
            if character.source_collection.to_lowercase() != collection.to_lowercase() {
                return false;
            }
        }
        if self.min_quality.is_some_and(|min| character.quality_score < min) {
            return false;
        }
        if self.max_quality.is_some_and(|max| character.quality_score > max) {
            return false;
        }
        if let Some(filter) = &self.tags {
            let has = |tag: &String| contains_case_insensitive(&character.tags, tag);
            let ok = if filter.match_all {
                filter.tags.iter().all(has)
            } else {
                filter.tags.iter().any(has)
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// Result ordering for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NameAsc,
    /// Score descending, then name ascending.
    QualityDesc,
    /// Collection, then name, both ascending.
    CollectionThenName,
}

impl SortOrder {
    pub fn order_by(&self) -> &'static str {
        match self {
            Self::NameAsc => "name ASC, id ASC",
            Self::QualityDesc => "quality_score DESC, name ASC, id ASC",
            Self::CollectionThenName => "source_collection ASC, name ASC, id ASC",
        }
    }

    pub fn compare(&self, a: &Character, b: &Character) -> std::cmp::Ordering {
        let by_name = || a.name.cmp(&b.name).then(a.id.cmp(&b.id));
        match self {
            Self::NameAsc => by_name(),
            Self::QualityDesc => b
                .quality_score
                .total_cmp(&a.quality_score)
                .then_with(by_name),
            Self::CollectionThenName => a
                .source_collection
                .cmp(&b.source_collection)
                .then_with(by_name),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch results
// ---------------------------------------------------------------------------

/// One rejected item from [`crate::repositories::CharacterRepo::save_many`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    /// Position of the item in the input.
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSaveReport {
    /// IDs of saved records, in input order (merged saves report the existing id).
    pub saved_ids: Vec<DbId>,
    pub failures: Vec<BatchFailure>,
}

impl BatchSaveReport {
    pub fn total(&self) -> usize {
        self.saved_ids.len() + self.failures.len()
    }
}
