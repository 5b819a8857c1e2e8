//! Storage abstraction layer for Quiver.
//!
//! Every persisted byte (catalog, manifests, segment files, index snapshots and
//! write-ahead logs) goes through the [`Storage`] trait. Two backends exist:
//!
//! - [`FileStorage`]: disk-based persistent storage rooted at a data directory
//! - [`MemoryStorage`]: in-memory storage for tests and ephemeral engines
//!
//! [`PrefixedStorage`] scopes a backend to one collection's directory.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use quiver::storage::{MemoryStorage, PrefixedStorage, Storage};
//!
//! # fn main() -> quiver::error::Result<()> {
//! let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
//! let scoped = PrefixedStorage::new("collections/docs", base.clone());
//! scoped.write_atomic("MANIFEST", b"{}")?;
//! assert!(base.file_exists("collections/docs/MANIFEST"));
//! # Ok(())
//! # }
//! ```

pub mod file;
pub mod memory;
pub mod prefixed;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use prefixed::PrefixedStorage;
pub use traits::*;
