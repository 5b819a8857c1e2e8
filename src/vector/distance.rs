//! Distance metrics for vector similarity calculation.
//!
//! Every metric is expressed as a distance: smaller means more similar, and an
//! exact match scores `0` under cosine and L2.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};
use crate::util::simd;

/// Distance metrics supported by collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine distance (1 - cosine similarity)
    #[default]
    Cosine,
    /// Squared Euclidean distance
    L2,
    /// Inner-product distance (1 - dot product)
    Dot,
}

impl DistanceMetric {
    /// Calculate the distance between two vectors of equal length.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        if a.len() != b.len() {
            return Err(QuiverError::dimension_mismatch(a.len(), b.len()));
        }
        Ok(self.distance_unchecked(a, b))
    }

    /// Distance without the length check, for callers that validated already.
    #[inline]
    pub fn distance_unchecked(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                let norm_a = simd::norm(a);
                let norm_b = simd::norm(b);

                if norm_a == 0.0 || norm_b == 0.0 {
                    1.0 // Maximum distance for zero vectors
                } else {
                    let cosine = (simd::dot_product(a, b) / (norm_a * norm_b)).clamp(-1.0, 1.0);
                    (1.0 - cosine).max(0.0)
                }
            }
            DistanceMetric::L2 => simd::squared_l2(a, b),
            DistanceMetric::Dot => 1.0 - simd::dot_product(a, b),
        }
    }

    /// Get the name of this distance metric.
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
            DistanceMetric::Dot => "dot",
        }
    }

    /// Parse a distance metric from a string.
    pub fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            "dot" | "ip" | "dot_product" => Ok(DistanceMetric::Dot),
            _ => Err(QuiverError::invalid_argument(format!(
                "Unknown distance metric: {s}"
            ))),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DistanceMetric {
    type Err = QuiverError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

/// Order `(distance, id)` pairs: ascending distance, ties by ascending id.
///
/// NaN distances sort last.
#[inline]
pub fn compare_scored(a_dist: f32, a_id: &str, b_dist: f32, b_id: &str) -> Ordering {
    a_dist
        .partial_cmp(&b_dist)
        .unwrap_or_else(|| a_dist.is_nan().cmp(&b_dist.is_nan()))
        .then_with(|| a_id.cmp(b_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_distance() {
        let metric = DistanceMetric::Cosine;
        assert!(metric.distance(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]).unwrap().abs() < 1e-6);
        assert!((metric.distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!((metric.distance(&[1.0, 0.0], &[-1.0, 0.0]).unwrap() - 2.0).abs() < 1e-6);
        assert_eq!(metric.distance(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 1.0);
    }

    #[test]
    fn test_l2_is_squared() {
        let metric = DistanceMetric::L2;
        assert_eq!(metric.distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap(), 25.0);
    }

    #[test]
    fn test_dot_distance() {
        let metric = DistanceMetric::Dot;
        assert_eq!(metric.distance(&[1.0, 2.0], &[3.0, 4.0]).unwrap(), 1.0 - 11.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = DistanceMetric::L2.distance(&[1.0], &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, QuiverError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!(DistanceMetric::parse_str("COSINE").unwrap(), DistanceMetric::Cosine);
        assert_eq!("euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert_eq!(DistanceMetric::parse_str("ip").unwrap(), DistanceMetric::Dot);
        assert!(DistanceMetric::parse_str("manhattan").is_err());

        assert_eq!(serde_json::to_string(&DistanceMetric::L2).unwrap(), "\"l2\"");
        let parsed: DistanceMetric = serde_json::from_str("\"dot\"").unwrap();
        assert_eq!(parsed, DistanceMetric::Dot);
    }

    #[test]
    fn test_compare_scored_ties_by_id() {
        assert_eq!(compare_scored(0.5, "b", 0.5, "a"), Ordering::Greater);
        assert_eq!(compare_scored(0.1, "z", 0.5, "a"), Ordering::Less);
        assert_eq!(compare_scored(f32::NAN, "a", 0.5, "b"), Ordering::Greater);
    }
}
