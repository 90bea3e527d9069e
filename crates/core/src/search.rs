//! Full-text search constants and helpers.
//!
//! This module lives in `core` (zero internal deps) so both the PostgreSQL
//! store and the in-memory store rank and annotate results the same way.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::character::{
    CharacterRecord, FIELD_ABILITIES, FIELD_DESCRIPTION, FIELD_NAME, FIELD_OCCUPATION,
};

// ---------------------------------------------------------------------------
// Relevance weights
// ---------------------------------------------------------------------------

/// PostgreSQL tsvector weight for the name (highest priority).
pub const WEIGHT_NAME: char = 'A';

/// PostgreSQL tsvector weight for the description.
pub const WEIGHT_DESCRIPTION: char = 'B';

/// PostgreSQL tsvector weight for abilities and occupation.
pub const WEIGHT_ATTRIBUTES: char = 'C';

/// Numeric value of each weight class, matching `ts_rank`'s defaults
/// (`{D, C, B, A} = {0.1, 0.2, 0.4, 1.0}`).
pub fn weight_value(class: char) -> f64 {
    match class {
        'A' => 1.0,
        'B' => 0.4,
        'C' => 0.2,
        _ => 0.1,
    }
}

/// Fields covered by the text index, in the order matches are reported.
pub const SEARCHABLE_FIELDS: &[&str] =
    &[FIELD_NAME, FIELD_DESCRIPTION, FIELD_ABILITIES, FIELD_OCCUPATION];

// ---------------------------------------------------------------------------
// Relevance normalization
// ---------------------------------------------------------------------------

/// Divisor applied to the store's native text score.
///
/// Uncalibrated; tune against real rankings before relying on absolute values.
pub const RELEVANCE_SCALE: f64 = 10.0;

/// Map a native text-match score onto `[0, 1]`.
pub fn normalize_relevance(native_score: f64) -> f64 {
    if !native_score.is_finite() {
        return 0.0;
    }
    (native_score / RELEVANCE_SCALE).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Query builder helpers
// ---------------------------------------------------------------------------

/// Sanitize user input into a list of terms suitable for tsquery construction.
///
/// - Splits on whitespace.
/// - Strips non-alphanumeric characters (except `_`) from each term's edges.
/// - Drops empty terms.
///
/// Returns `None` if the input yields no usable terms.
fn sanitize_terms(query: &str) -> Option<Vec<&str>> {
    let terms: Vec<&str> = query
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .filter(|t| !t.is_empty())
        .collect();

    if terms.is_empty() { None } else { Some(terms) }
}

/// Sanitize and convert user input into a PostgreSQL `tsquery` string.
///
/// - Whitespace-separated terms are joined with `&` (AND).
/// - Empty or whitespace-only input returns `None`.
/// - Special characters that could break tsquery parsing are stripped.
///
/// # Examples
///
/// ```
/// use charvault_core::search::build_tsquery;
/// assert_eq!(build_tsquery("monkey luffy"), Some("monkey & luffy".to_string()));
/// assert_eq!(build_tsquery("  "), None);
/// assert_eq!(build_tsquery("luffy"), Some("luffy".to_string()));
/// ```
pub fn build_tsquery(query: &str) -> Option<String> {
    sanitize_terms(query).map(|terms| {
        terms
            .iter()
            .map(|t| t.replace(|c: char| !c.is_alphanumeric() && c != '_', " "))
            .flat_map(|t| t.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .collect::<Vec<_>>()
            .join(" & ")
    })
}

/// Lowercased query terms, split the same way as [`tokenize`].
pub fn query_terms(query: &str) -> Vec<String> {
    sanitize_terms(query)
        .map(|terms| terms.iter().flat_map(|t| tokenize(t)).collect())
        .unwrap_or_default()
}

/// Split text into lowercased alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

// ---------------------------------------------------------------------------
// Match annotation
// ---------------------------------------------------------------------------

/// Characters of context kept on each side of a highlighted match.
pub const HIGHLIGHT_CONTEXT_CHARS: usize = 50;

/// Markup placed around the highlighted match.
pub const HIGHLIGHT_MARKER: &str = "**";

/// A search hit annotated for display.
#[derive(Debug, Clone, Serialize)]
pub struct SearchAnnotations {
    pub matched_fields: Vec<String>,
    pub highlights: BTreeMap<String, String>,
}

/// Fields of `record` that contain `query` as a case-insensitive substring.
pub fn matched_fields(record: &CharacterRecord, query: &str) -> Vec<String> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }
    let contains = |text: &str| find_case_insensitive(text, query).is_some();

    let mut fields = Vec::new();
    if contains(&record.name) {
        fields.push(FIELD_NAME.to_string());
    }
    if record.description.as_deref().is_some_and(contains) {
        fields.push(FIELD_DESCRIPTION.to_string());
    }
    if record.abilities.iter().any(|a| contains(a)) {
        fields.push(FIELD_ABILITIES.to_string());
    }
    if record.occupation.as_deref().is_some_and(contains) {
        fields.push(FIELD_OCCUPATION.to_string());
    }
    fields
}

/// Byte range of the first case-insensitive occurrence of `needle`.
pub fn find_case_insensitive(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();

    for (start, _) in haystack.char_indices() {
        let mut matched = 0;
        for (offset, c) in haystack[start..].char_indices() {
            let lowered: Vec<char> = c.to_lowercase().collect();
            if needle.len() < matched + lowered.len()
                || needle[matched..matched + lowered.len()] != lowered[..]
            {
                break;
            }
            matched += lowered.len();
            if matched == needle.len() {
                return Some((start, start + offset + c.len_utf8()));
            }
        }
    }
    None
}

/// Snippet of `text` around the first occurrence of `query`, with the match
/// wrapped in [`HIGHLIGHT_MARKER`]. `None` when the query does not occur.
pub fn highlight_snippet(text: &str, query: &str) -> Option<String> {
    let (start, end) = find_case_insensitive(text, query.trim())?;

    let before: String = {
        let chars: Vec<char> = text[..start].chars().collect();
        let skip = chars.len().saturating_sub(HIGHLIGHT_CONTEXT_CHARS);
        chars[skip..].iter().collect()
    };
    let after: String = text[end..].chars().take(HIGHLIGHT_CONTEXT_CHARS).collect();

    Some(format!(
        "{before}{HIGHLIGHT_MARKER}{}{HIGHLIGHT_MARKER}{after}",
        &text[start..end]
    ))
}

/// Compute matched fields and highlights for one hit.
pub fn annotate(record: &CharacterRecord, query: &str) -> SearchAnnotations {
    let mut highlights = BTreeMap::new();
    if let Some(snippet) = record
        .description
        .as_deref()
        .and_then(|d| highlight_snippet(d, query))
    {
        highlights.insert(FIELD_DESCRIPTION.to_string(), snippet);
    }
    SearchAnnotations {
        matched_fields: matched_fields(record, query),
        highlights,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
