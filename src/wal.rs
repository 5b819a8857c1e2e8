//! Durable ingestion: the write-ahead log and the commit pipeline built on it.

pub mod file;
pub mod pipeline;

pub use file::{SeqNumber, WalEntry, WalManager, WalRecord};
pub use pipeline::{
    BackpressurePolicy, CommitConfig, CommitPipeline, ReplayReport, WriteMode, WriteReceipt,
    WriteState,
};
