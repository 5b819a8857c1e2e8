//! Configuration for the query coordinator.

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Threads searching segments in parallel.
    pub threads: usize,

    /// Largest `k` a query may ask for.
    pub max_k: usize,

    /// Timeout applied to queries that do not set their own.
    pub default_timeout_ms: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            threads: num_cpus::get(),
            max_k: 10_000,
            default_timeout_ms: None,
        }
    }
}

impl QueryConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_max_k(mut self, max_k: usize) -> Self {
        self.max_k = max_k;
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(QuiverError::invalid_config("query.threads must be at least 1"));
        }
        if self.max_k == 0 {
            return Err(QuiverError::invalid_config("query.max_k must be at least 1"));
        }
        Ok(())
    }
}
