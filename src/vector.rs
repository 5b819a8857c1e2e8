//! Vector records, distance metrics, the record codec and metadata filters.
//!
//! # Module Structure
//!
//! - `record`: `VectorRecord` and its scalar metadata
//! - `distance`: distance metrics (cosine, squared L2, dot)
//! - `codec`: checksummed binary encoding of records
//! - `filter`: metadata "where" predicates

pub mod codec;
pub mod distance;
pub mod filter;
pub mod record;

pub use self::codec::VectorCodec;
pub use self::distance::DistanceMetric;
pub use self::filter::{Comparison, MetadataFilter};
pub use self::record::{Metadata, MetadataValue, VectorRecord};
