//! Character record model shared by every layer.
//!
//! A [`CharacterRecord`] is the canonical, already-cleaned form of one
//! scraped character. Raw scraper output arrives as a [`RawCharacter`] map and
//! is turned into a record by [`crate::normalize::normalize`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Field names
// ---------------------------------------------------------------------------

pub const FIELD_NAME: &str = "name";
pub const FIELD_SOURCE_COLLECTION: &str = "source_collection";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_AGE: &str = "age";
pub const FIELD_GENDER: &str = "gender";
pub const FIELD_OCCUPATION: &str = "occupation";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_ABILITIES: &str = "abilities";
pub const FIELD_RELATIONSHIPS: &str = "relationships";
pub const FIELD_IMAGE_URLS: &str = "image_urls";
pub const FIELD_LOCAL_PATHS: &str = "local_paths";
pub const FIELD_SOURCE_URL: &str = "source_url";
pub const FIELD_QUALITY_SCORE: &str = "quality_score";
pub const FIELD_TAGS: &str = "tags";

/// Older scrapers keyed the collection as `anime`.
pub const FIELD_SOURCE_COLLECTION_ALIASES: &[&str] = &[FIELD_SOURCE_COLLECTION, "anime"];
pub const FIELD_LOCAL_PATHS_ALIASES: &[&str] = &[FIELD_LOCAL_PATHS, "local_image_paths"];
pub const FIELD_QUALITY_SCORE_ALIASES: &[&str] = &[FIELD_QUALITY_SCORE, "data_quality_score"];
pub const FIELD_TAGS_ALIASES: &[&str] = &[FIELD_TAGS, "custom_tags"];

// ---------------------------------------------------------------------------
// Length limits (in characters)
// ---------------------------------------------------------------------------

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_SOURCE_COLLECTION_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 5_000;
pub const MAX_AGE_LEN: usize = 50;
pub const MAX_GENDER_LEN: usize = 20;
pub const MAX_OCCUPATION_LEN: usize = 200;
pub const MAX_STATUS_LEN: usize = 50;

/// Prefixes an image reference must start with to be kept.
pub const ACCEPTED_URL_PREFIXES: &[&str] = &["http://", "https://", "/"];

/// Literal age used when nothing numeric can be recovered.
pub const AGE_UNKNOWN: &str = "Unknown";

/// Unvalidated attribute map as produced by a scraper.
pub type RawCharacter = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The `(name, source_collection)` pair that identifies one character.
///
/// Comparison is exact; the store's uniqueness constraint uses the same rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub name: String,
    pub source_collection: String,
}

impl IdentityKey {
    pub fn new(name: impl Into<String>, source_collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_collection: source_collection.into(),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.name, self.source_collection)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A normalized character record, independent of where it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub name: String,
    pub source_collection: String,
    pub description: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub occupation: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub abilities: Vec<String>,
    /// Relation kind (e.g. `"brother"`) to the referenced character's name.
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub local_paths: Vec<String>,
    pub source_url: String,
    pub scraped_at: Timestamp,
    pub updated_at: Timestamp,
    pub quality_score: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CharacterRecord {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.name.clone(), self.source_collection.clone())
    }

    /// Serialize back into the raw attribute-map shape accepted by the
    /// normalizer. Used to overlay partial updates onto a stored record.
    pub fn to_raw(&self) -> Result<RawCharacter, CoreError> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(other) => Err(CoreError::Internal(format!(
                "character record serialized to non-object JSON: {other}"
            ))),
            Err(e) => Err(CoreError::Internal(format!(
                "failed to serialize character record: {e}"
            ))),
        }
    }

    /// Add a tag unless an equal tag (ignoring case) is already present.
    ///
    /// Returns `true` if the tag list changed.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || contains_case_insensitive(&self.tags, tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }
}

// ---------------------------------------------------------------------------
// List helpers
// ---------------------------------------------------------------------------

/// Whether `items` holds `candidate` ignoring case.
pub fn contains_case_insensitive(items: &[String], candidate: &str) -> bool {
    let lowered = candidate.to_lowercase();
    items.iter().any(|item| item.to_lowercase() == lowered)
}

/// Drop case-insensitive duplicates, keeping the first-seen spelling and order.
pub fn dedup_case_insensitive<I>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.to_lowercase()))
        .collect()
}

/// Drop exact duplicates, keeping first-seen order.
pub fn dedup_exact<I>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// `existing` followed by the entries of `incoming` not already present,
/// compared case-insensitively.
pub fn union_case_insensitive(existing: &[String], incoming: &[String]) -> Vec<String> {
    dedup_case_insensitive(existing.iter().chain(incoming).cloned())
}

/// `existing` followed by the entries of `incoming` not already present,
/// compared exactly.
pub fn union_exact(existing: &[String], incoming: &[String]) -> Vec<String> {
    dedup_exact(existing.iter().chain(incoming).cloned())
}
