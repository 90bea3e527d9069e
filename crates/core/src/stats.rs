//! Collection-wide statistics shapes and the arithmetic behind them.
//!
//! Stores supply raw counts as a [`StatisticsSnapshot`]; the rounding,
//! bucketing and percentage rules live here so every backend reports the
//! same numbers.

use serde::Serialize;

use crate::quality::round_to;

/// Number of quality histogram buckets.
pub const HISTOGRAM_BUCKETS: usize = 5;

/// Bucket width in thousandths of a score point (0.2).
const BUCKET_WIDTH_MILLIS: i64 = 200;

/// Records scraped within this many days count as recent.
pub const RECENT_WINDOW_DAYS: i64 = 7;

/// Length of the top-collections and top-abilities lists.
pub const TOP_N: i64 = 10;

/// Histogram bucket index for a score. Buckets are `[0.0, 0.2)`, …,
/// `[0.6, 0.8)`, `[0.8, 1.0]`; the last bucket includes `1.0`.
pub fn histogram_bucket(score: f64) -> usize {
    let millis = round_to(score.clamp(0.0, 1.0) * 1000.0, 0) as i64;
    ((millis / BUCKET_WIDTH_MILLIS) as usize).min(HISTOGRAM_BUCKETS - 1)
}

/// A value with its occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountBucket {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBucket {
    /// e.g. `"0.4-0.6"`.
    pub label: String,
    pub lower: f64,
    pub upper: f64,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageCoverage {
    pub with_images: i64,
    pub without_images: i64,
    /// Share of records with at least one image, in percent, 2 decimals.
    pub percentage: f64,
}

/// Raw aggregate counts as computed by a store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatisticsSnapshot {
    pub total: i64,
    pub top_collections: Vec<CountBucket>,
    /// `None` for an empty collection.
    pub average_quality_score: Option<f64>,
    pub histogram_counts: [i64; HISTOGRAM_BUCKETS],
    pub recent_count: i64,
    pub top_abilities: Vec<CountBucket>,
    pub with_images: i64,
}

/// Read-only summary of the stored collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterStatistics {
    pub total: i64,
    pub top_collections: Vec<CountBucket>,
    pub average_quality_score: f64,
    pub quality_histogram: Vec<HistogramBucket>,
    pub recent_count: i64,
    pub top_abilities: Vec<CountBucket>,
    pub image_coverage: ImageCoverage,
}

impl From<StatisticsSnapshot> for CharacterStatistics {
    fn from(snapshot: StatisticsSnapshot) -> Self {
        Self {
            total: snapshot.total,
            top_collections: snapshot.top_collections,
            average_quality_score: round_to(snapshot.average_quality_score.unwrap_or(0.0), 3),
            quality_histogram: build_histogram(snapshot.histogram_counts),
            recent_count: snapshot.recent_count,
            top_abilities: snapshot.top_abilities,
            image_coverage: image_coverage(snapshot.with_images, snapshot.total),
        }
    }
}

pub fn build_histogram(counts: [i64; HISTOGRAM_BUCKETS]) -> Vec<HistogramBucket> {
    counts
        .iter()
        .enumerate()
        .map(|(index, count)| {
            let lower = index as f64 * 0.2;
            let upper = lower + 0.2;
            HistogramBucket {
                label: format!("{lower:.1}-{upper:.1}"),
                lower: round_to(lower, 1),
                upper: round_to(upper, 1),
                count: *count,
            }
        })
        .collect()
}

pub fn image_coverage(with_images: i64, total: i64) -> ImageCoverage {
    let percentage = round_to(with_images as f64 / total.max(1) as f64 * 100.0, 2);
    ImageCoverage {
        with_images,
        without_images: (total - with_images).max(0),
        percentage,
    }
}

/// Order `(value, count)` pairs by count descending, then value, and keep the
/// first `limit`.
pub fn top_counts(mut counts: Vec<CountBucket>, limit: usize) -> Vec<CountBucket> {
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    counts.truncate(limit);
    counts
}
