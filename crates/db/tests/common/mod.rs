//! Shared helpers for repository tests.

#![allow(dead_code)]

use std::sync::Arc;

use charvault_core::character::RawCharacter;
use charvault_db::config::RepoConfig;
use charvault_db::repositories::CharacterRepo;
use charvault_db::store::{CharacterStore, MemoryCharacterStore};
use serde_json::{json, Value};

/// Unwrap a `json!` object literal into a raw character map.
pub fn raw(value: Value) -> RawCharacter {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn minimal(name: &str, collection: &str) -> RawCharacter {
    raw(json!({
        "name": name,
        "source_collection": collection,
        "source_url": format!("https://wiki.example/{name}"),
    }))
}

/// A raw record that scores 1.0.
pub fn full(name: &str, collection: &str) -> RawCharacter {
    raw(json!({
        "name": name,
        "source_collection": collection,
        "source_url": format!("https://wiki.example/{name}"),
        "description": "A pirate who ate a Devil Fruit and set out to sea to find the legendary \
                        treasure and become the next King of the Pirates.",
        "age": "19",
        "gender": "Male",
        "occupation": "Pirate Captain",
        "status": "Alive",
        "abilities": ["Gomu Gomu no Mi", "Haki", "Gear Fifth"],
        "relationships": { "brother": "Portgas D. Ace" },
        "image_urls": ["https://img.example/luffy.png"],
    }))
}

pub fn repo_with(store: Arc<MemoryCharacterStore>, config: RepoConfig) -> CharacterRepo {
    let store: Arc<dyn CharacterStore> = store;
    CharacterRepo::new(store, config)
}

/// A repository over a fresh in-memory store, plus the store itself for
/// direct inspection.
pub fn memory_repo() -> (CharacterRepo, Arc<MemoryCharacterStore>) {
    let store = Arc::new(MemoryCharacterStore::new());
    (repo_with(Arc::clone(&store), RepoConfig::default()), store)
}
