//! Reconciliation of two observations of the same character.
//!
//! Used when a save collides with an existing record on the identity key.
//! The policy is deterministic and field-specific; the result fully replaces
//! the stored record.

use crate::character::{union_case_insensitive, union_exact, CharacterRecord};
use crate::types::Timestamp;

/// Merge `incoming` into `existing`.
///
/// - Scalar descriptive fields take the incoming value only when it is
///   non-empty and strictly longer than the current one.
/// - `abilities` and `tags` are unioned ignoring case; `image_urls` and
///   `local_paths` are unioned exactly. Existing entries come first.
/// - `relationships` are unioned; incoming wins on a shared key.
/// - `source_url` and `scraped_at` are kept; `updated_at` becomes `now`.
/// - `quality_score` is recomputed from the merged fields.
pub fn merge(existing: &CharacterRecord, incoming: &CharacterRecord, now: Timestamp) -> CharacterRecord {
    debug_assert_eq!(existing.identity_key(), incoming.identity_key());

    let mut relationships = existing.relationships.clone();
    relationships.extend(
        incoming
            .relationships
            .iter()
            .map(|(kind, target)| (kind.clone(), target.clone())),
    );

    let mut merged = CharacterRecord {
        name: existing.name.clone(),
        source_collection: existing.source_collection.clone(),
        description: prefer_longer(&existing.description, &incoming.description),
        age: prefer_longer(&existing.age, &incoming.age),
        gender: prefer_longer(&existing.gender, &incoming.gender),
        occupation: prefer_longer(&existing.occupation, &incoming.occupation),
        status: prefer_longer(&existing.status, &incoming.status),
        abilities: union_case_insensitive(&existing.abilities, &incoming.abilities),
        relationships,
        image_urls: union_exact(&existing.image_urls, &incoming.image_urls),
        local_paths: union_exact(&existing.local_paths, &incoming.local_paths),
        source_url: existing.source_url.clone(),
        scraped_at: existing.scraped_at,
        updated_at: now.max(existing.scraped_at),
        quality_score: existing.quality_score,
        tags: union_case_insensitive(&existing.tags, &incoming.tags),
    };
    merged.refresh_quality_score();
    merged
}

fn prefer_longer(existing: &Option<String>, incoming: &Option<String>) -> Option<String> {
    let current_len = existing.as_deref().map_or(0, |v| v.chars().count());
    match incoming.as_deref() {
        Some(new) if !new.trim().is_empty() && new.chars().count() > current_len => {
            Some(new.to_string())
        }
        _ => existing.clone(),
    }
}
