//! Repository layer over the character store.

pub mod character_repo;

pub use character_repo::CharacterRepo;
