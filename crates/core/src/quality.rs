//! Completeness scoring for character records.
//!
//! The score is a weighted sum over populated fields, rounded to three
//! decimals and capped at `1.0`. The weights add up to `1.05`, so a fully
//! populated record saturates.

use serde::{Deserialize, Serialize};

use crate::character::{CharacterRecord, AGE_UNKNOWN};

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

pub const WEIGHT_NAME: f64 = 0.20;
pub const WEIGHT_SOURCE_COLLECTION: f64 = 0.20;
pub const WEIGHT_DESCRIPTION: f64 = 0.15;
pub const WEIGHT_DETAILED_DESCRIPTION: f64 = 0.05;
pub const WEIGHT_KNOWN_AGE: f64 = 0.10;
/// Spread evenly across gender, occupation and status.
pub const WEIGHT_PROFILE_FIELDS: f64 = 0.15;
pub const WEIGHT_ABILITIES: f64 = 0.05;
pub const WEIGHT_MANY_ABILITIES: f64 = 0.05;
pub const WEIGHT_RELATIONSHIPS: f64 = 0.05;
pub const WEIGHT_IMAGES: f64 = 0.05;

/// Descriptions longer than this many characters earn [`WEIGHT_DESCRIPTION`].
pub const DESCRIPTION_MIN_CHARS: usize = 20;
/// Descriptions longer than this many characters also earn [`WEIGHT_DETAILED_DESCRIPTION`].
pub const DESCRIPTION_DETAILED_CHARS: usize = 100;
/// Ability count that earns [`WEIGHT_MANY_ABILITIES`].
pub const MANY_ABILITIES: usize = 3;

pub const MAX_SCORE: f64 = 1.0;

/// Round `value` to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn filled(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Compute the completeness score of `record`. Always in `[0, 1]`.
pub fn score(record: &CharacterRecord) -> f64 {
    let mut total = 0.0;

    if !record.name.trim().is_empty() {
        total += WEIGHT_NAME;
    }
    if !record.source_collection.trim().is_empty() {
        total += WEIGHT_SOURCE_COLLECTION;
    }

    let description_len = record
        .description
        .as_deref()
        .map(|d| d.trim().chars().count())
        .unwrap_or(0);
    if description_len > DESCRIPTION_MIN_CHARS {
        total += WEIGHT_DESCRIPTION;
        if description_len > DESCRIPTION_DETAILED_CHARS {
            total += WEIGHT_DETAILED_DESCRIPTION;
        }
    }

    if let Some(age) = record.age.as_deref() {
        let age = age.trim();
        if !age.is_empty() && !age.eq_ignore_ascii_case(AGE_UNKNOWN) {
            total += WEIGHT_KNOWN_AGE;
        }
    }

    let profile = [&record.gender, &record.occupation, &record.status];
    let filled_profile = profile.iter().filter(|f| filled(f)).count();
    total += WEIGHT_PROFILE_FIELDS * filled_profile as f64 / profile.len() as f64;

    if !record.abilities.is_empty() {
        total += WEIGHT_ABILITIES;
        if record.abilities.len() >= MANY_ABILITIES {
            total += WEIGHT_MANY_ABILITIES;
        }
    }
    if !record.relationships.is_empty() {
        total += WEIGHT_RELATIONSHIPS;
    }
    if !record.image_urls.is_empty() {
        total += WEIGHT_IMAGES;
    }

    round_to(total, 3).clamp(0.0, MAX_SCORE)
}

/// Whether `stored` differs from the freshly `computed` score. Exact: every
/// score written here is already rounded by [`score`].
pub fn score_changed(stored: f64, computed: f64) -> bool {
    stored.to_bits() != computed.to_bits()
}

impl CharacterRecord {
    /// Recompute `quality_score` from the current field values.
    pub fn refresh_quality_score(&mut self) {
        self.quality_score = score(self);
    }
}

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

pub const TIER_HIGH_MIN: f64 = 0.8;
pub const TIER_MEDIUM_MIN: f64 = 0.5;

/// Coarse classification of a quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    Medium,
    Low,
}

impl QualityTier {
    pub fn from_score(score: f64) -> Self {
        if score >= TIER_HIGH_MIN {
            Self::High
        } else if score >= TIER_MEDIUM_MIN {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
