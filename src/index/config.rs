//! Configuration for the per-segment proximity graph.

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};

/// Configuration for HNSW index construction and search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Maximum number of connections per node in layer 0.
    pub m: usize,
    /// Maximum number of connections per node in higher layers (typically m/2).
    pub m_upper: usize,
    /// Size of the candidate list during construction.
    pub ef_construction: usize,
    /// Default size of the candidate list during search; queries may override it.
    pub ef_search: usize,
    /// Random seed for layer assignment, so rebuilding a segment reproduces its graph.
    pub seed: u64,
    /// Build the index as part of sealing rather than on first query.
    pub eager_build: bool,
    /// Persist built indexes next to their segment files.
    pub persist: bool,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            m_upper: 8,
            ef_construction: 200,
            ef_search: 64,
            seed: 42,
            eager_build: true,
            persist: true,
        }
    }
}

impl HnswConfig {
    /// Set the M parameter (connections per node).
    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self.m_upper = (m / 2).max(1);
        self
    }

    /// Set the ef_construction parameter.
    pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    /// Set the default ef_search parameter.
    pub fn with_ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = ef_search;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_eager_build(mut self, eager_build: bool) -> Self {
        self.eager_build = eager_build;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Level multiplier derived from M (1 / ln M).
    pub fn level_multiplier(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(QuiverError::invalid_config("index.m must be >= 2"));
        }
        if self.m_upper == 0 {
            return Err(QuiverError::invalid_config("index.m_upper must be > 0"));
        }
        if self.ef_construction < self.m {
            return Err(QuiverError::invalid_config(
                "index.ef_construction must be >= index.m",
            ));
        }
        if self.ef_search == 0 {
            return Err(QuiverError::invalid_config("index.ef_search must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hnsw_config_defaults() {
        let config = HnswConfig::default();
        assert_eq!(config.m, 16);
        assert_eq!(config.m_upper, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hnsw_config_validation() {
        assert!(HnswConfig::default().with_m(1).validate().is_err());
        assert!(
            HnswConfig::default()
                .with_m(32)
                .with_ef_construction(16)
                .validate()
                .is_err()
        );
        assert!(HnswConfig::default().with_ef_search(0).validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HnswConfig = serde_json::from_str(r#"{"m": 8}"#).unwrap();
        assert_eq!(config.m, 8);
        assert_eq!(config.ef_construction, 200);
    }
}
