//! Pure domain logic for the character record store.
//!
//! Nothing in this crate touches the network or the filesystem. The
//! persistence layer (`charvault-db`) calls into these modules to clean raw
//! scraped input, score it, merge colliding observations, and shape search
//! and statistics results.

pub mod character;
pub mod error;
pub mod merge;
pub mod normalize;
pub mod pagination;
pub mod quality;
pub mod search;
pub mod stats;
pub mod types;
