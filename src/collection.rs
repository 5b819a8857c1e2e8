//! Named collections and their lifecycle.
//!
//! # Module Structure
//!
//! - `config`: immutable per-collection settings
//! - `catalog`: the persisted name to collection-id map
//! - `directory`: id to newest-version map deciding which records are live
//! - `compaction`: policy and execution of segment merges
//! - `gc`: background deletion of unreferenced files
//! - `collection`: one collection's read and write operations
//! - `manager`: create, open, drop and list collections

pub mod catalog;
#[allow(clippy::module_inception)]
pub mod collection;
pub mod compaction;
pub mod config;
pub mod directory;
pub mod gc;
pub mod manager;

pub use self::collection::{Collection, CollectionInfo, CollectionSettings, SegmentInfo};
pub use self::compaction::{CompactionConfig, CompactionOutcome, CompactionPlan};
pub use self::config::CollectionConfig;
pub use self::directory::RecordDirectory;
pub use self::manager::CollectionManager;
