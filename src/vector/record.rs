//! Vector records and their scalar metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A scalar metadata value.
///
/// Metadata is restricted to a closed set of scalar types. The JSON form is
/// untagged, so `"a"`, `1.5` and `true` map onto the three variants directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl MetadataValue {
    /// Name of the scalar type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            MetadataValue::Bool(_) => "bool",
            MetadataValue::Number(_) => "number",
            MetadataValue::String(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Number(n) => write!(f, "{n}"),
            MetadataValue::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Number(value as f64)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// Metadata attached to a record. Ordered so encoding is deterministic.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A vector record as stored in a segment.
///
/// `seq` is the write-ahead log sequence number of the write that produced
/// this version of the record. A tombstone (`deleted == true`) carries an
/// empty embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub seq: u64,
}

impl VectorRecord {
    /// Create a live record with no metadata.
    pub fn new(id: impl Into<String>, embedding: Vec<f32>) -> Self {
        VectorRecord {
            id: id.into(),
            embedding,
            metadata: Metadata::new(),
            document: None,
            deleted: false,
            seq: 0,
        }
    }

    /// Create a tombstone for `id`.
    pub fn tombstone(id: impl Into<String>) -> Self {
        VectorRecord {
            id: id.into(),
            embedding: Vec::new(),
            metadata: Metadata::new(),
            document: None,
            deleted: true,
            seq: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a single metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}
