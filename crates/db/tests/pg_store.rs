//! Integration tests for the PostgreSQL character store.
//!
//! Exercises the repository layer against a real database:
//! - Identity-keyed insert and merge
//! - Versioned replace and identity-conflict classification
//! - Weighted full-text search
//! - Tag filters, duplicate cleanup and statistics

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use charvault_core::pagination::PageRequest;
use charvault_db::config::RepoConfig;
use charvault_db::error::StoreError;
use charvault_db::repositories::CharacterRepo;
use charvault_db::store::{CharacterStore, InsertOutcome, PgCharacterStore, ReplaceOutcome};
use serde_json::json;
use sqlx::PgPool;

use common::{full, minimal, raw};

fn pg_repo(pool: &PgPool) -> CharacterRepo {
    CharacterRepo::new(
        Arc::new(PgCharacterStore::new(pool.clone())),
        RepoConfig::default(),
    )
}

// ---------------------------------------------------------------------------
// Insert and merge
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn insert_reports_conflict_with_existing_id(pool: PgPool) {
    let store = PgCharacterStore::new(pool);
    let record = charvault_core::normalize::normalize(&minimal("Luffy", "One Piece"), chrono::Utc::now())
        .unwrap()
        .record;

    let first = store.insert(&record).await.unwrap();
    let InsertOutcome::Inserted(id) = first else {
        panic!("expected insert, got {first:?}");
    };
    assert_eq!(store.insert(&record).await.unwrap(), InsertOutcome::Conflict(id));
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn save_merges_on_identity_collision(pool: PgPool) {
    let repo = pg_repo(&pool);

    let first = repo
        .save(&raw(json!({
            "name": "Monkey D. Luffy",
            "source_collection": "One Piece",
            "source_url": "https://wiki.example/luffy",
            "description": "Rubber pirate.",
            "abilities": ["Gomu Gomu no Mi"],
            "relationships": { "brother": "Ace" },
        })))
        .await
        .unwrap();
    let second = repo
        .save(&raw(json!({
            "name": "Monkey D. Luffy",
            "source_collection": "One Piece",
            "source_url": "https://other.example/luffy",
            "description": "Captain of the Straw Hat Pirates.",
            "abilities": ["Haki", "GOMU GOMU NO MI"],
            "relationships": { "brother": "Portgas D. Ace", "grandfather": "Garp" },
        })))
        .await
        .unwrap();
    assert_eq!(first, second);

    let merged = repo.find_by_id(&first.to_string()).await.unwrap().unwrap();
    assert_eq!(merged.abilities, vec!["Gomu Gomu no Mi", "Haki"]);
    assert_eq!(merged.relationships.0["brother"], "Portgas D. Ace");
    assert_eq!(merged.relationships.0["grandfather"], "Garp");
    assert_eq!(merged.source_url, "https://wiki.example/luffy");
    assert_eq!(merged.version, 2);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM characters")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn replace_checks_version(pool: PgPool) {
    let repo = pg_repo(&pool);
    let store = PgCharacterStore::new(pool);
    let id = repo.save(&minimal("Nami", "One Piece")).await.unwrap();
    let stored = store.find_by_id(id).await.unwrap().unwrap();

    let mut record = stored.to_record();
    record.status = Some("Alive".into());

    assert_eq!(
        store.replace(id, stored.version + 7, &record).await.unwrap(),
        ReplaceOutcome::VersionMismatch
    );
    assert_eq!(
        store.replace(id, stored.version, &record).await.unwrap(),
        ReplaceOutcome::Replaced
    );
    assert_eq!(
        store.replace(id + 1000, 1, &record).await.unwrap(),
        ReplaceOutcome::Missing
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn renaming_onto_taken_identity_is_classified(pool: PgPool) {
    let repo = pg_repo(&pool);
    let store = PgCharacterStore::new(pool);
    repo.save(&minimal("Franky", "One Piece")).await.unwrap();
    let id = repo.save(&minimal("Cutty Flam", "One Piece")).await.unwrap();
    let stored = store.find_by_id(id).await.unwrap().unwrap();

    let mut record = stored.to_record();
    record.name = "Franky".into();
    let err = store.replace(id, stored.version, &record).await.unwrap_err();
    assert_matches!(err, StoreError::IdentityConflict(_));

    assert!(!repo
        .update(&id.to_string(), &raw(json!({ "name": "Franky" })))
        .await
        .unwrap());
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn search_uses_weighted_text_index(pool: PgPool) {
    let repo = pg_repo(&pool);
    repo.save(&raw(json!({
        "name": "Roronoa Zoro",
        "source_collection": "One Piece",
        "source_url": "u",
        "description": "Zoro is the swordsman of the Straw Hat crew.",
    })))
    .await
    .unwrap();
    repo.save(&full("Monkey D. Luffy", "One Piece")).await.unwrap();

    let page = repo
        .search("swordsman", None, PageRequest::default())
        .await
        .unwrap();

    assert_eq!(page.total_count, 1);
    let hit = &page.items[0];
    assert_eq!(hit.character.name, "Roronoa Zoro");
    assert!(hit.relevance_score > 0.0 && hit.relevance_score <= 1.0);
    assert_eq!(hit.highlights["description"], "Zoro is the **swordsman** of the Straw Hat crew.");

    let empty = repo
        .search("swordsman", Some("naruto"), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(empty.total_count, 0);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn tag_filters_use_array_operators(pool: PgPool) {
    let repo = pg_repo(&pool);
    for (name, tags) in [("Alpha", json!(["x", "y"])), ("Bravo", json!(["x"])), ("Charlie", json!(["z"]))] {
        let mut input = minimal(name, "Test");
        input.insert("tags".into(), tags);
        repo.save(&input).await.unwrap();
    }

    let all = repo
        .list_by_tags(&["x".into(), "y".into()], true, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(all.total_count, 1);
    assert_eq!(all.items[0].name, "Alpha");

    let any = repo
        .list_by_tags(&["y".into(), "z".into()], false, PageRequest::default())
        .await
        .unwrap();
    let names: Vec<&str> = any.items.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Alpha", "Charlie"]);

    let folded = repo
        .list_by_tags(&["X".into(), "Y".into()], true, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(folded.total_count, 1);
    assert_eq!(folded.items[0].name, "Alpha");
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn collection_listing_is_case_insensitive(pool: PgPool) {
    let repo = pg_repo(&pool);
    repo.save(&minimal("Zoro", "One Piece")).await.unwrap();
    repo.save(&minimal("Nami", "One Piece")).await.unwrap();

    let page = repo
        .list_by_collection("ONE PIECE", PageRequest::new(1, 1))
        .await
        .unwrap();
    assert_eq!(page.total_count, 2);
    assert_eq!(page.items[0].name, "Nami");
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn cleanup_removes_all_but_earliest(pool: PgPool) {
    sqlx::query("ALTER TABLE characters DROP CONSTRAINT uq_characters_identity")
        .execute(&pool)
        .await
        .unwrap();
    for days_ago in [1, 3, 2] {
        sqlx::query(
            "INSERT INTO characters (name, source_collection, source_url, quality_score, scraped_at, updated_at)
             VALUES ('Ace', 'One Piece', 'u', 0.4, NOW() - make_interval(days => $1), NOW())",
        )
        .bind(days_ago)
        .execute(&pool)
        .await
        .unwrap();
    }

    let repo = pg_repo(&pool);
    assert_eq!(repo.cleanup_duplicates().await.unwrap(), 2);

    let remaining: Vec<(i64,)> = sqlx::query_as("SELECT id FROM characters")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    // The second insert was scraped three days ago.
    assert_eq!(remaining[0].0, 2);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn recompute_is_idempotent(pool: PgPool) {
    let repo = pg_repo(&pool);
    let id = repo.save(&minimal("Sanji", "One Piece")).await.unwrap();
    sqlx::query("UPDATE characters SET quality_score = 0.95 WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(repo.recompute_all_quality_scores().await.unwrap(), 1);
    assert_eq!(repo.recompute_all_quality_scores().await.unwrap(), 0);
    let stored = repo.find_by_id(&id.to_string()).await.unwrap().unwrap();
    assert_eq!(stored.quality_score, 0.4);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn statistics_bucket_edges_match_core(pool: PgPool) {
    let repo = pg_repo(&pool);
    repo.save(&minimal("Zoro", "One Piece")).await.unwrap();
    repo.save(&full("Monkey D. Luffy", "One Piece")).await.unwrap();
    repo.save(&minimal("Sasuke", "Naruto")).await.unwrap();

    let stats = repo.statistics().await.unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.top_collections[0].value, "One Piece");
    let counts: Vec<i64> = stats.quality_histogram.iter().map(|b| b.count).collect();
    assert_eq!(counts, vec![0, 0, 2, 0, 1]);
    assert_eq!(stats.average_quality_score, 0.6);
    assert_eq!(stats.recent_count, 3);
    assert_eq!(stats.image_coverage.with_images, 1);
    assert_eq!(stats.image_coverage.percentage, 33.33);
}
