//! Similarity query requests.

use serde::{Deserialize, Serialize};

use crate::vector::MetadataFilter;

pub const DEFAULT_K: usize = 10;

fn default_k() -> usize {
    DEFAULT_K
}

/// Whether a query sees writes that are still in the active segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Search sealed segments and the active buffer.
    #[default]
    #[serde(alias = "strong")]
    ReadYourWrites,
    /// Search sealed segments only. Cheaper, but recent writes are missing.
    #[serde(alias = "eventual")]
    SealedOnly,
}

/// Which stored fields are returned with each hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Include {
    pub metadata: bool,
    pub document: bool,
    pub embedding: bool,
}

impl Default for Include {
    fn default() -> Self {
        Include {
            metadata: true,
            document: false,
            embedding: false,
        }
    }
}

impl Include {
    pub fn all() -> Self {
        Include {
            metadata: true,
            document: true,
            embedding: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub embedding: Vec<f32>,

    #[serde(default = "default_k")]
    pub k: usize,

    /// Metadata predicate; `where` is accepted as an alias.
    #[serde(default, alias = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<MetadataFilter>,

    #[serde(default)]
    pub consistency: Consistency,

    #[serde(default)]
    pub include: Include,

    /// Candidate list size for graph search. Larger is slower and more exact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(embedding: Vec<f32>, k: usize) -> Self {
        QueryRequest {
            embedding,
            k,
            filter: None,
            consistency: Consistency::default(),
            include: Include::default(),
            ef_search: None,
            timeout_ms: None,
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_include(mut self, include: Include) -> Self {
        self.include = include;
        self
    }

    pub fn with_ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = Some(ef_search);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}
