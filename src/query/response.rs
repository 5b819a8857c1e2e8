//! Query results.

use serde::{Deserialize, Serialize};

use crate::vector::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: String,
    pub distance: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// At most `k` hits, closest first, ties broken by ascending id.
    pub results: Vec<QueryHit>,
    /// Some segments could not be searched; `results` may be incomplete.
    pub degraded: bool,
    #[serde(default)]
    pub unavailable_segments: Vec<u64>,
    #[serde(default)]
    pub segments_searched: usize,
    #[serde(default)]
    pub took_ms: f64,
}

impl QueryResponse {
    pub fn ids(&self) -> Vec<&str> {
        self.results.iter().map(|hit| hit.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
