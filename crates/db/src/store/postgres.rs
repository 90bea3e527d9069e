//! PostgreSQL implementation of [`CharacterStore`].

use async_trait::async_trait;
use charvault_core::character::{CharacterRecord, IdentityKey};
use charvault_core::stats::{CountBucket, StatisticsSnapshot, HISTOGRAM_BUCKETS};
use charvault_core::types::{DbId, Timestamp};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::StoreError;
use crate::models::character::{Character, CharacterFilter, SortOrder};
use crate::store::{
    CharacterStore, DuplicateGroup, InsertOutcome, ReplaceOutcome, ScoredCharacter, TextQuery,
};

/// Column list shared across queries to avoid repetition.
///
/// Excludes `search_vector`, which is maintained by a trigger and never read.
const COLUMNS: &str = "id, name, source_collection, description, age, gender, occupation, \
     status, abilities, relationships, image_urls, local_paths, source_url, quality_score, \
     tags, version, scraped_at, updated_at";

/// `$1..$5` filter predicates shared by `list` and `count`.
const FILTER_PREDICATES: &str = "($1::TEXT IS NULL OR LOWER(source_collection) = LOWER($1))
       AND ($2::FLOAT8 IS NULL OR quality_score >= $2)
       AND ($3::FLOAT8 IS NULL OR quality_score <= $3)
       AND ($4::TEXT[] IS NULL OR CASE WHEN $5::BOOLEAN
            THEN ARRAY(SELECT LOWER(t) FROM unnest(tags) AS t)
                 @> ARRAY(SELECT LOWER(t) FROM unnest($4::TEXT[]) AS t)
            ELSE ARRAY(SELECT LOWER(t) FROM unnest(tags) AS t)
                 && ARRAY(SELECT LOWER(t) FROM unnest($4::TEXT[]) AS t)
            END)";

/// How often `insert` re-reads after losing a race against a concurrent
/// insert whose row was not yet visible to the statement snapshot.
const INSERT_READ_ATTEMPTS: u32 = 3;

#[derive(FromRow)]
struct ScoredRow {
    #[sqlx(flatten)]
    character: Character,
    native_score: f64,
}

#[derive(FromRow)]
struct InsertRow {
    id: DbId,
    inserted: bool,
}

#[derive(FromRow)]
struct TotalsRow {
    total: i64,
    average: Option<f64>,
    with_images: i64,
    recent: i64,
}

/// Character store backed by the `characters` table.
#[derive(Debug, Clone)]
pub struct PgCharacterStore {
    pool: PgPool,
}

impl PgCharacterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, id: DbId) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM characters WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn versioned_outcome(
        &self,
        id: DbId,
        rows_affected: u64,
    ) -> Result<ReplaceOutcome, StoreError> {
        if rows_affected > 0 {
            Ok(ReplaceOutcome::Replaced)
        } else if self.exists(id).await? {
            Ok(ReplaceOutcome::VersionMismatch)
        } else {
            Ok(ReplaceOutcome::Missing)
        }
    }
}

#[async_trait]
impl CharacterStore for PgCharacterStore {
    async fn insert(&self, record: &CharacterRecord) -> Result<InsertOutcome, StoreError> {
        // The CTE either inserts or, on an identity collision, falls through to
        // the existing row. A row committed concurrently after the statement
        // snapshot was taken is invisible to the SELECT arm, so retry.
        let query = "WITH ins AS (
                INSERT INTO characters
                    (name, source_collection, description, age, gender, occupation, status,
                     abilities, relationships, image_urls, local_paths, source_url,
                     quality_score, tags, scraped_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT ON CONSTRAINT uq_characters_identity DO NOTHING
                RETURNING id
             )
             SELECT id, TRUE AS inserted FROM ins
             UNION ALL
             SELECT id, FALSE AS inserted FROM characters
             WHERE name = $1 AND source_collection = $2
             LIMIT 1";

        for attempt in 1..=INSERT_READ_ATTEMPTS {
            let row = sqlx::query_as::<_, InsertRow>(query)
                .bind(&record.name)
                .bind(&record.source_collection)
                .bind(&record.description)
                .bind(&record.age)
                .bind(&record.gender)
                .bind(&record.occupation)
                .bind(&record.status)
                .bind(&record.abilities)
                .bind(Json(&record.relationships))
                .bind(&record.image_urls)
                .bind(&record.local_paths)
                .bind(&record.source_url)
                .bind(record.quality_score)
                .bind(&record.tags)
                .bind(record.scraped_at)
                .bind(record.updated_at)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(InsertRow { id, inserted: true }) => return Ok(InsertOutcome::Inserted(id)),
                Some(InsertRow { id, inserted: false }) => return Ok(InsertOutcome::Conflict(id)),
                None => {
                    tracing::debug!(
                        name = %record.name,
                        source_collection = %record.source_collection,
                        attempt,
                        "Conflicting row not yet visible, retrying insert",
                    );
                }
            }
        }

        Err(StoreError::Contention {
            key: record.identity_key(),
            attempts: INSERT_READ_ATTEMPTS,
        })
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Character>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM characters WHERE id = $1");
        let character = sqlx::query_as::<_, Character>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(character)
    }

    async fn find_by_identity(&self, key: &IdentityKey) -> Result<Option<Character>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM characters WHERE name = $1 AND source_collection = $2
             ORDER BY scraped_at ASC, id ASC
             LIMIT 1"
        );
        let character = sqlx::query_as::<_, Character>(&query)
            .bind(&key.name)
            .bind(&key.source_collection)
            .fetch_optional(&self.pool)
            .await?;
        Ok(character)
    }

    async fn replace(
        &self,
        id: DbId,
        expected_version: i64,
        record: &CharacterRecord,
    ) -> Result<ReplaceOutcome, StoreError> {
        let result = sqlx::query(
            "UPDATE characters SET
                name = $3,
                source_collection = $4,
                description = $5,
                age = $6,
                gender = $7,
                occupation = $8,
                status = $9,
                abilities = $10,
                relationships = $11,
                image_urls = $12,
                local_paths = $13,
                source_url = $14,
                quality_score = $15,
                tags = $16,
                updated_at = $17,
                version = version + 1
             WHERE id = $1 AND version = $2",
        )
        .bind(id)
        .bind(expected_version)
        .bind(&record.name)
        .bind(&record.source_collection)
        .bind(&record.description)
        .bind(&record.age)
        .bind(&record.gender)
        .bind(&record.occupation)
        .bind(&record.status)
        .bind(&record.abilities)
        .bind(Json(&record.relationships))
        .bind(&record.image_urls)
        .bind(&record.local_paths)
        .bind(&record.source_url)
        .bind(record.quality_score)
        .bind(&record.tags)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::classify(e, &record.identity_key()))?;

        self.versioned_outcome(id, result.rows_affected()).await
    }

    async fn set_quality_score(
        &self,
        id: DbId,
        expected_version: i64,
        score: f64,
        updated_at: Timestamp,
    ) -> Result<ReplaceOutcome, StoreError> {
        let result = sqlx::query(
            "UPDATE characters SET
                quality_score = $3,
                updated_at = GREATEST($4, scraped_at),
                version = version + 1
             WHERE id = $1 AND version = $2",
        )
        .bind(id)
        .bind(expected_version)
        .bind(score)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        self.versioned_outcome(id, result.rows_affected()).await
    }

    async fn delete(&self, id: DbId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM characters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_many(&self, ids: &[DbId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM characters WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list(
        &self,
        filter: &CharacterFilter,
        order: SortOrder,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Character>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM characters
             WHERE {FILTER_PREDICATES}
             ORDER BY {}
             LIMIT $6 OFFSET $7",
            order.order_by()
        );
        let tag_filter = filter.tags.as_ref();
        let characters = sqlx::query_as::<_, Character>(&query)
            .bind(&filter.collection)
            .bind(filter.min_quality)
            .bind(filter.max_quality)
            .bind(tag_filter.map(|t| t.tags.clone()))
            .bind(tag_filter.is_some_and(|t| t.match_all))
            .bind(limit)
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(characters)
    }

    async fn count(&self, filter: &CharacterFilter) -> Result<i64, StoreError> {
        let query = format!("SELECT COUNT(*) FROM characters WHERE {FILTER_PREDICATES}");
        let tag_filter = filter.tags.as_ref();
        let total: i64 = sqlx::query_scalar(&query)
            .bind(&filter.collection)
            .bind(filter.min_quality)
            .bind(filter.max_quality)
            .bind(tag_filter.map(|t| t.tags.clone()))
            .bind(tag_filter.is_some_and(|t| t.match_all))
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    async fn search(
        &self,
        query: &TextQuery,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ScoredCharacter>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS},
                    ts_rank(search_vector, to_tsquery('english', $1))::FLOAT8 AS native_score
             FROM characters
             WHERE search_vector @@ to_tsquery('english', $1)
               AND ($2::TEXT IS NULL OR LOWER(source_collection) = LOWER($2))
             ORDER BY native_score DESC, name ASC, id ASC
             LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query_as::<_, ScoredRow>(&sql)
            .bind(&query.tsquery)
            .bind(&query.collection)
            .bind(limit)
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ScoredCharacter {
                character: row.character,
                native_score: row.native_score,
            })
            .collect())
    }

    async fn count_search(&self, query: &TextQuery) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM characters
             WHERE search_vector @@ to_tsquery('english', $1)
               AND ($2::TEXT IS NULL OR LOWER(source_collection) = LOWER($2))",
        )
        .bind(&query.tsquery)
        .bind(&query.collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn chunk_after(&self, after_id: DbId, limit: i64) -> Result<Vec<Character>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM characters WHERE id > $1 ORDER BY id ASC LIMIT $2"
        );
        let characters = sqlx::query_as::<_, Character>(&query)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(characters)
    }

    async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError> {
        let rows: Vec<(String, String, Vec<DbId>)> = sqlx::query_as(
            "SELECT name, source_collection, array_agg(id ORDER BY scraped_at ASC, id ASC)
             FROM characters
             GROUP BY name, source_collection
             HAVING COUNT(*) > 1
             ORDER BY name, source_collection",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, source_collection, ids)| DuplicateGroup {
                key: IdentityKey::new(name, source_collection),
                ids,
            })
            .collect())
    }

    async fn statistics(
        &self,
        recent_since: Timestamp,
        top_n: i64,
    ) -> Result<StatisticsSnapshot, StoreError> {
        let totals = sqlx::query_as::<_, TotalsRow>(
            "SELECT COUNT(*) AS total,
                    AVG(quality_score)::FLOAT8 AS average,
                    COUNT(*) FILTER (WHERE cardinality(image_urls) > 0) AS with_images,
                    COUNT(*) FILTER (WHERE scraped_at >= $1) AS recent
             FROM characters",
        )
        .bind(recent_since)
        .fetch_one(&self.pool)
        .await?;

        let collections: Vec<(String, i64)> = sqlx::query_as(
            "SELECT source_collection, COUNT(*) FROM characters
             GROUP BY source_collection
             ORDER BY COUNT(*) DESC, source_collection COLLATE \"C\" ASC
             LIMIT $1",
        )
        .bind(top_n)
        .fetch_all(&self.pool)
        .await?;

        let abilities: Vec<(String, i64)> = sqlx::query_as(
            "SELECT ability, COUNT(*) FROM characters, unnest(abilities) AS ability
             GROUP BY ability
             ORDER BY COUNT(*) DESC, ability COLLATE \"C\" ASC
             LIMIT $1",
        )
        .bind(top_n)
        .fetch_all(&self.pool)
        .await?;

        // Bucket on rounded thousandths, the same edges as `stats::histogram_bucket`.
        let buckets: Vec<(i32, i64)> = sqlx::query_as(
            "SELECT LEAST(FLOOR(ROUND((quality_score * 1000)::NUMERIC) / 200), 4)::INT4 AS bucket,
                    COUNT(*)
             FROM characters
             GROUP BY bucket",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut histogram_counts = [0i64; HISTOGRAM_BUCKETS];
        for (bucket, count) in buckets {
            let index = usize::try_from(bucket)
                .map_err(|_| StoreError::Corrupt(format!("negative histogram bucket {bucket}")))?;
            histogram_counts[index.min(HISTOGRAM_BUCKETS - 1)] += count;
        }

        let to_buckets = |rows: Vec<(String, i64)>| -> Vec<CountBucket> {
            rows.into_iter()
                .map(|(value, count)| CountBucket { value, count })
                .collect()
        };

        Ok(StatisticsSnapshot {
            total: totals.total,
            top_collections: to_buckets(collections),
            average_quality_score: totals.average,
            histogram_counts,
            recent_count: totals.recent,
            top_abilities: to_buckets(abilities),
            with_images: totals.with_images,
        })
    }
}
