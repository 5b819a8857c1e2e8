//! Per-collection configuration.

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};
use crate::index::HnswConfig;
use crate::vector::DistanceMetric;

/// Largest accepted embedding dimension.
pub const MAX_DIMENSION: usize = 65_536;

/// Immutable settings of a collection, persisted in its manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub dimension: usize,
    #[serde(default)]
    pub metric: DistanceMetric,
    #[serde(default)]
    pub index: HnswConfig,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>, dimension: usize, metric: DistanceMetric) -> Self {
        CollectionConfig {
            name: name.into(),
            dimension,
            metric,
            index: HnswConfig::default(),
        }
    }

    pub fn with_index(mut self, index: HnswConfig) -> Self {
        self.index = index;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.dimension == 0 || self.dimension > MAX_DIMENSION {
            return Err(QuiverError::invalid_argument(format!(
                "dimension must be between 1 and {MAX_DIMENSION}, got {}",
                self.dimension
            )));
        }
        self.index.validate()
    }
}

/// Collection names are 1-128 characters of `[A-Za-z0-9_.-]`, not starting
/// with a dot.
pub fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if name.is_empty() || name.len() > 128 || !valid_chars || name.starts_with('.') {
        return Err(QuiverError::invalid_argument(format!(
            "invalid collection name {name:?}: use 1-128 characters of [A-Za-z0-9_.-]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(CollectionConfig::new("docs", 3, DistanceMetric::Cosine).validate().is_ok());
        assert!(CollectionConfig::new("docs", 0, DistanceMetric::Cosine).validate().is_err());
        assert!(CollectionConfig::new("", 3, DistanceMetric::L2).validate().is_err());
        assert!(CollectionConfig::new("a/b", 3, DistanceMetric::L2).validate().is_err());
        assert!(CollectionConfig::new("..", 3, DistanceMetric::L2).validate().is_err());
        assert!(CollectionConfig::new("my-docs_v1.2", 3, DistanceMetric::Dot).validate().is_ok());
    }

    #[test]
    fn test_json_defaults() {
        let config: CollectionConfig =
            serde_json::from_str(r#"{"name":"docs","dimension":3}"#).unwrap();
        assert_eq!(config.metric, DistanceMetric::Cosine);
        assert_eq!(config.index, HnswConfig::default());
    }
}
