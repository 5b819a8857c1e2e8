//! # Quiver
//!
//! An embeddable vector-similarity storage and query engine.
//!
//! ## Features
//!
//! - Named collections of fixed-dimension embeddings with metadata
//! - Write-ahead logged, segment-based storage with crash recovery
//! - HNSW approximate nearest neighbour search per sealed segment
//! - Metadata `where` filters and read-your-writes consistency
//! - Background compaction and garbage collection
//! - A small HTTP API and a `quiver start` launcher
//!
//! ## Example
//!
//! ```no_run
//! use quiver::engine::{Engine, EngineConfig};
//! use quiver::query::QueryRequest;
//! use quiver::vector::{DistanceMetric, VectorRecord};
//!
//! # fn main() -> quiver::error::Result<()> {
//! let engine = Engine::start(EngineConfig::in_memory())?;
//! let docs = engine.create_collection("docs", 3, DistanceMetric::Cosine)?;
//! docs.add(VectorRecord::new("a", vec![1.0, 0.0, 0.0]))?;
//! let response = docs.query(&QueryRequest::new(vec![1.0, 0.0, 0.0], 1))?;
//! assert_eq!(response.ids(), vec!["a"]);
//! engine.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod collection;
pub mod engine;
pub mod error;
pub mod index;
pub mod query;
pub mod segment;
pub mod server;
pub mod storage;
pub mod util;
pub mod vector;
pub mod wal;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
