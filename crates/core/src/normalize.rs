//! Raw attribute map → canonical [`CharacterRecord`].
//!
//! Scraped wiki data is noisy: citation markers in descriptions, free-text
//! ages ("17 (pre-timeskip), 19"), duplicate abilities with varying case and
//! relative image paths. Each field has its own cleaning rule here; anything
//! structurally unusable is rejected with a [`CoreError`] before it can reach
//! the store.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::character::*;
use crate::error::CoreError;
use crate::quality::round_to;
use crate::types::Timestamp;

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Anything outside word characters, whitespace and `. - ' ( ) &`.
static IDENTITY_JUNK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s.\-'()&]").expect("valid regex"));

/// `[1]`, `[12]`, `[citation needed]`, `[note 3]`.
static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[\w\s]+\]").expect("valid regex"));

static EMPTY_BRACKETS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*\)|\[\s*\]").expect("valid regex"));

static AGE_ACCEPTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+|\d+-\d+|unknown|immortal|ageless)$").expect("valid regex")
});

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

/// Output of [`normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCharacter {
    /// The cleaned record. `quality_score` is already computed from its fields.
    pub record: CharacterRecord,
    /// A score the caller supplied alongside the raw data, if it was in range.
    /// Kept for diagnostics only; the stored score is always recomputed.
    pub supplied_quality_score: Option<f64>,
}

/// Clean and validate a raw attribute map.
///
/// `now` becomes both `scraped_at` and `updated_at` of the returned record.
pub fn normalize(raw: &RawCharacter, now: Timestamp) -> Result<NormalizedCharacter, CoreError> {
    let name = required_identity_text(raw, &[FIELD_NAME], FIELD_NAME)?;
    check_len(FIELD_NAME, &name, MAX_NAME_LEN)?;

    let source_collection = required_identity_text(
        raw,
        FIELD_SOURCE_COLLECTION_ALIASES,
        FIELD_SOURCE_COLLECTION,
    )?;
    check_len(FIELD_SOURCE_COLLECTION, &source_collection, MAX_SOURCE_COLLECTION_LEN)?;

    let source_url = text_field(raw, &[FIELD_SOURCE_URL])?
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(CoreError::MissingField(FIELD_SOURCE_URL))?;

    let description = text_field(raw, &[FIELD_DESCRIPTION])?
        .map(|d| clean_description(&d))
        .filter(|d| !d.is_empty());
    if let Some(d) = &description {
        check_len(FIELD_DESCRIPTION, d, MAX_DESCRIPTION_LEN)?;
    }

    let age = age_field(raw)?;
    if let Some(a) = &age {
        check_len(FIELD_AGE, a, MAX_AGE_LEN)?;
    }

    let gender = short_text(raw, FIELD_GENDER, MAX_GENDER_LEN)?;
    let occupation = short_text(raw, FIELD_OCCUPATION, MAX_OCCUPATION_LEN)?;
    let status = short_text(raw, FIELD_STATUS, MAX_STATUS_LEN)?;

    let abilities = dedup_case_insensitive(string_list(raw, &[FIELD_ABILITIES])?);
    let tags = dedup_case_insensitive(string_list(raw, FIELD_TAGS_ALIASES)?);
    let image_urls = dedup_exact(
        string_list(raw, &[FIELD_IMAGE_URLS])?
            .into_iter()
            .filter(|url| is_accepted_url(url)),
    );
    let local_paths = dedup_exact(string_list(raw, FIELD_LOCAL_PATHS_ALIASES)?);
    let relationships = relationships_field(raw)?;
    let supplied_quality_score = supplied_score(raw)?;

    let mut record = CharacterRecord {
        name,
        source_collection,
        description,
        age,
        gender,
        occupation,
        status,
        abilities,
        relationships,
        image_urls,
        local_paths,
        source_url,
        scraped_at: now,
        updated_at: now,
        quality_score: 0.0,
        tags,
    };
    record.refresh_quality_score();

    Ok(NormalizedCharacter {
        record,
        supplied_quality_score,
    })
}

// ---------------------------------------------------------------------------
// Field cleaners
// ---------------------------------------------------------------------------

fn collapse_whitespace(value: &str) -> String {
    WHITESPACE_RE.replace_all(value.trim(), " ").into_owned()
}

/// Cleaning rule for `name` and `source_collection`.
pub fn clean_identity_text(value: &str) -> String {
    let collapsed = collapse_whitespace(value);
    let stripped = IDENTITY_JUNK_RE.replace_all(&collapsed, "");
    collapse_whitespace(&stripped)
}

/// Strip citation markers and empty brackets, then collapse whitespace.
pub fn clean_description(value: &str) -> String {
    let without_citations = CITATION_RE.replace_all(value, "");
    let collapsed = collapse_whitespace(&without_citations);
    let without_empty = EMPTY_BRACKETS_RE.replace_all(&collapsed, "");
    collapse_whitespace(&without_empty)
}

/// Normalize a free-text age into a number, a range `A-B`, or a literal token.
pub fn normalize_age(value: &str) -> String {
    let cleaned = value.trim();
    if AGE_ACCEPTED_RE.is_match(cleaned) {
        return cleaned.to_string();
    }
    let numbers: Vec<&str> = DIGITS_RE.find_iter(cleaned).map(|m| m.as_str()).collect();
    match numbers.as_slice() {
        [] => AGE_UNKNOWN.to_string(),
        [only] => (*only).to_string(),
        [first, second, ..] => format!("{first}-{second}"),
    }
}

pub fn is_accepted_url(url: &str) -> bool {
    ACCEPTED_URL_PREFIXES.iter().any(|p| url.starts_with(p))
}

// ---------------------------------------------------------------------------
// Raw map access
// ---------------------------------------------------------------------------

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// First non-null value among `keys`.
fn lookup<'a, 'k>(raw: &'a RawCharacter, keys: &[&'k str]) -> Option<(&'k str, &'a Value)> {
    keys.iter().find_map(|key| match raw.get(*key) {
        Some(v) if !v.is_null() => Some((*key, v)),
        _ => None,
    })
}

fn text_field(raw: &RawCharacter, keys: &[&str]) -> Result<Option<String>, CoreError> {
    match lookup(raw, keys) {
        None => Ok(None),
        Some((_, Value::String(s))) => Ok(Some(s.clone())),
        Some((_, Value::Number(n))) => Ok(Some(n.to_string())),
        Some((key, other)) => Err(CoreError::Validation(format!(
            "field '{key}' must be a string, got {}",
            json_type(other)
        ))),
    }
}

fn required_identity_text(
    raw: &RawCharacter,
    keys: &[&str],
    field: &'static str,
) -> Result<String, CoreError> {
    text_field(raw, keys)?
        .map(|s| clean_identity_text(&s))
        .filter(|s| !s.is_empty())
        .ok_or(CoreError::MissingField(field))
}

fn short_text(
    raw: &RawCharacter,
    field: &'static str,
    max_len: usize,
) -> Result<Option<String>, CoreError> {
    let value = text_field(raw, &[field])?
        .map(|s| collapse_whitespace(&s))
        .filter(|s| !s.is_empty());
    if let Some(v) = &value {
        check_len(field, v, max_len)?;
    }
    Ok(value)
}

fn age_field(raw: &RawCharacter) -> Result<Option<String>, CoreError> {
    match lookup(raw, &[FIELD_AGE]) {
        None => Ok(None),
        Some((_, Value::Number(n))) => {
            let rendered = match (n.as_u64(), n.as_f64()) {
                (Some(whole), _) => whole.to_string(),
                (None, Some(f)) if f >= 0.0 => (f.trunc() as u64).to_string(),
                _ => AGE_UNKNOWN.to_string(),
            };
            Ok(Some(rendered))
        }
        Some((_, Value::String(s))) if s.trim().is_empty() => Ok(None),
        Some((_, Value::String(s))) => Ok(Some(normalize_age(s))),
        Some((key, other)) => Err(CoreError::Validation(format!(
            "field '{key}' must be a string or number, got {}",
            json_type(other)
        ))),
    }
}

/// A list of trimmed, whitespace-collapsed, non-empty strings. A bare string is
/// accepted as a one-element list; non-string array elements are skipped.
fn string_list(raw: &RawCharacter, keys: &[&str]) -> Result<Vec<String>, CoreError> {
    let items: Vec<&str> = match lookup(raw, keys) {
        None => return Ok(Vec::new()),
        Some((_, Value::String(s))) => vec![s.as_str()],
        Some((_, Value::Array(values))) => values.iter().filter_map(Value::as_str).collect(),
        Some((key, other)) => {
            return Err(CoreError::Validation(format!(
                "field '{key}' must be a list of strings, got {}",
                json_type(other)
            )))
        }
    };
    Ok(items
        .into_iter()
        .map(collapse_whitespace)
        .filter(|s| !s.is_empty())
        .collect())
}

fn relationships_field(raw: &RawCharacter) -> Result<BTreeMap<String, String>, CoreError> {
    let map = match lookup(raw, &[FIELD_RELATIONSHIPS]) {
        None => return Ok(BTreeMap::new()),
        Some((_, Value::Object(map))) => map,
        Some((key, other)) => {
            return Err(CoreError::Validation(format!(
                "field '{key}' must be an object, got {}",
                json_type(other)
            )))
        }
    };

    let mut relationships = BTreeMap::new();
    for (kind, target) in map {
        let target = match target {
            Value::Null => continue,
            Value::String(s) => collapse_whitespace(s),
            other => other.to_string(),
        };
        let kind = collapse_whitespace(kind);
        if kind.is_empty() || target.is_empty() {
            continue;
        }
        relationships.insert(kind, target);
    }
    Ok(relationships)
}

/// Accept a caller-supplied score only when it lies in `[0, 1]`.
fn supplied_score(raw: &RawCharacter) -> Result<Option<f64>, CoreError> {
    let value = match lookup(raw, FIELD_QUALITY_SCORE_ALIASES) {
        None => return Ok(None),
        Some((_, Value::Number(n))) => n.as_f64(),
        Some((key, Value::String(s))) => Some(s.trim().parse::<f64>().map_err(|_| {
            CoreError::Validation(format!("field '{key}' must be numeric, got '{s}'"))
        })?),
        Some((key, other)) => {
            return Err(CoreError::Validation(format!(
                "field '{key}' must be a number, got {}",
                json_type(other)
            )))
        }
    };
    Ok(value
        .filter(|score| (0.0..=1.0).contains(score))
        .map(|score| round_to(score, 3)))
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), CoreError> {
    let len = value.chars().count();
    if len > max {
        return Err(CoreError::Validation(format!(
            "field '{field}' is {len} characters long, maximum is {max}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn raw(value: Value) -> RawCharacter {
        match value {
            Value::Object(map) => map,
            other => panic!("test input must be an object, got {other}"),
        }
    }

    fn normalize_ok(value: Value) -> CharacterRecord {
        normalize(&raw(value), Utc::now()).unwrap().record
    }

    // -- required fields -----------------------------------------------------

    #[test]
    fn minimal_record_normalizes_and_scores_floor() {
        let record = normalize_ok(json!({"name": "X", "source_collection": "Y", "source_url": "u"}));
        assert_eq!(record.name, "X");
        assert_eq!(record.source_collection, "Y");
        assert_eq!(record.quality_score, 0.4);
        assert_eq!(record.scraped_at, record.updated_at);
    }

    #[test]
    fn missing_name_is_rejected() {
        let err = normalize(&raw(json!({"source_collection": "Y", "source_url": "u"})), Utc::now())
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingField(FIELD_NAME)));
    }

    #[test]
    fn blank_source_url_is_rejected() {
        let err = normalize(
            &raw(json!({"name": "X", "source_collection": "Y", "source_url": "   "})),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MissingField(FIELD_SOURCE_URL)));
    }

    #[test]
    fn name_of_only_junk_counts_as_missing() {
        let err = normalize(
            &raw(json!({"name": "★☆", "source_collection": "Y", "source_url": "u"})),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MissingField(FIELD_NAME)));
    }

    #[test]
    fn legacy_anime_key_is_accepted_for_collection() {
        let record = normalize_ok(json!({"name": "Zoro", "anime": "One Piece", "source_url": "u"}));
        assert_eq!(record.source_collection, "One Piece");
    }

    #[test]
    fn wrong_type_is_a_validation_error() {
        let err = normalize(
            &raw(json!({"name": "X", "source_collection": "Y", "source_url": "u", "gender": ["M"]})),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn overlong_gender_is_rejected() {
        let err = normalize(
            &raw(json!({
                "name": "X", "source_collection": "Y", "source_url": "u",
                "gender": "g".repeat(MAX_GENDER_LEN + 1)
            })),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    // -- identity text -------------------------------------------------------

    #[test]
    fn identity_text_collapses_whitespace_and_strips_symbols() {
        assert_eq!(clean_identity_text("  Monkey   D.  Luffy!! "), "Monkey D. Luffy");
        assert_eq!(clean_identity_text("Nico Robin (Miss All-Sunday)"), "Nico Robin (Miss All-Sunday)");
        assert_eq!(clean_identity_text("Tom & Jerry's #1"), "Tom & Jerry's 1");
    }

    // -- description ---------------------------------------------------------

    #[test]
    fn description_drops_citations_and_empty_brackets() {
        let cleaned = clean_description("Captain of the crew.[1] Born in Foosha ()  Village[citation needed].");
        assert_eq!(cleaned, "Captain of the crew. Born in Foosha Village.");
    }

    #[test]
    fn blank_description_becomes_absent() {
        let record = normalize_ok(json!({
            "name": "X", "source_collection": "Y", "source_url": "u", "description": " [1] "
        }));
        assert_eq!(record.description, None);
    }

    // -- age -----------------------------------------------------------------

    #[test]
    fn age_accepts_plain_forms() {
        assert_eq!(normalize_age("19"), "19");
        assert_eq!(normalize_age(" 17-19 "), "17-19");
        assert_eq!(normalize_age("immortal"), "immortal");
        assert_eq!(normalize_age("Ageless"), "Ageless");
    }

    #[test]
    fn age_extracts_embedded_numbers() {
        assert_eq!(normalize_age("17 (debut)"), "17");
        assert_eq!(normalize_age("17 (pre-timeskip), 19 (post-timeskip)"), "17-19");
        assert_eq!(normalize_age("about 3, 4 or 5"), "3-4");
    }

    #[test]
    fn age_without_numbers_is_unknown() {
        assert_eq!(normalize_age("very old"), AGE_UNKNOWN);
    }

    #[test]
    fn numeric_age_is_rendered_as_integer() {
        let record = normalize_ok(json!({
            "name": "X", "source_collection": "Y", "source_url": "u", "age": 19
        }));
        assert_eq!(record.age.as_deref(), Some("19"));
    }

    // -- lists ---------------------------------------------------------------

    #[test]
    fn abilities_are_trimmed_and_deduplicated() {
        let record = normalize_ok(json!({
            "name": "X", "source_collection": "Y", "source_url": "u",
            "abilities": ["  Haki ", "", "haki", "Gomu  Gomu no Mi", 7, "HAKI"]
        }));
        assert_eq!(record.abilities, vec!["Haki", "Gomu Gomu no Mi"]);
    }

    #[test]
    fn image_urls_keep_only_accepted_prefixes() {
        let record = normalize_ok(json!({
            "name": "X", "source_collection": "Y", "source_url": "u",
            "image_urls": [
                "https://a.example/1.png", "ftp://a.example/2.png", "/local/3.png",
                "data:image/png;base64,AAAA", "https://a.example/1.png", "http://b.example/4.jpg"
            ]
        }));
        assert_eq!(
            record.image_urls,
            vec!["https://a.example/1.png", "/local/3.png", "http://b.example/4.jpg"]
        );
    }

    #[test]
    fn tags_accept_legacy_key_and_single_string() {
        let record = normalize_ok(json!({
            "name": "X", "source_collection": "Y", "source_url": "u", "custom_tags": "protagonist"
        }));
        assert_eq!(record.tags, vec!["protagonist"]);
    }

    #[test]
    fn relationships_drop_blank_entries() {
        let record = normalize_ok(json!({
            "name": "X", "source_collection": "Y", "source_url": "u",
            "relationships": {"brother": "Ace", "": "nobody", "rival": "  ", "mentor": null}
        }));
        assert_eq!(record.relationships.len(), 1);
        assert_eq!(record.relationships["brother"], "Ace");
    }

    // -- supplied score ------------------------------------------------------

    #[test]
    fn supplied_score_is_rounded_when_in_range() {
        let out = normalize(
            &raw(json!({"name": "X", "source_collection": "Y", "source_url": "u", "quality_score": 0.87654})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(out.supplied_quality_score, Some(0.877));
        assert_eq!(out.record.quality_score, 0.4);
    }

    #[test]
    fn out_of_range_supplied_score_is_discarded() {
        let out = normalize(
            &raw(json!({"name": "X", "source_collection": "Y", "source_url": "u", "data_quality_score": 1.7})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(out.supplied_quality_score, None);
        assert_eq!(out.record.quality_score, 0.4);
    }

    #[test]
    fn normalized_scores_stay_in_unit_interval() {
        let inputs = [
            json!({"name": "A", "source_collection": "B", "source_url": "u"}),
            json!({
                "name": "A", "source_collection": "B", "source_url": "u",
                "description": "d".repeat(400), "age": "forever 18", "gender": "F",
                "occupation": "O", "status": "S", "abilities": ["1", "2", "3", "4"],
                "relationships": {"k": "v"}, "image_urls": ["/i.png"], "tags": ["t"]
            }),
        ];
        for input in inputs {
            let record = normalize_ok(input);
            assert!((0.0..=1.0).contains(&record.quality_score));
        }
    }
}
