//! Approximate nearest-neighbor indexes.
//!
//! Sealed segments are searched through an [`HnswIndex`]; the active segment,
//! which has no index yet, through [`flat::scan`].

pub mod config;
pub mod flat;
pub mod hnsw;
pub mod snapshot;

pub use self::config::HnswConfig;
pub use self::hnsw::{HnswIndex, SearchCandidate, VectorSource};
