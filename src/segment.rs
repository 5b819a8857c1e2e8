//! Segment storage.
//!
//! A collection's records live in an ordered list of segments: any number of
//! immutable sealed segments plus one active segment that accepts appends.
//! The [`manifest`] records which segments exist and how much of the active
//! segment is durable.

pub mod active;
pub mod format;
pub mod manifest;
pub mod sealed;
pub mod store;

pub use active::{ActiveSegment, ActiveSnapshot};
pub use manifest::{ActiveState, Manifest, ManifestStore, SegmentDescriptor};
pub use sealed::{SealedSegment, SegmentHealth};
pub use store::{RecoveryReport, SegmentScan, SegmentStore, SegmentView};
