use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(feature = "test-utils")]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::{BackendError, IteratorHandle};

/// The set of datasets one backend instance serves, as reported by
/// `topology`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    /// Dataset name → opaque per-dataset metadata.
    #[serde(default)]
    pub datasets: HashMap<String, serde_json::Value>,
}

/// Reply to a prefilter query: a candidate count plus a drain cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Number of candidate files behind the iterator.
    pub file_count: u64,
    /// Cursor to drain the candidates with.
    pub iterator: IteratorHandle,
}

/// One drained batch of candidate paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopResult {
    /// Candidate file paths, possibly fewer than requested.
    #[serde(default)]
    pub files: Vec<String>,
    /// Whether the iterator was exhausted by this pop.
    pub iterator_empty: bool,
}

/// Contract of the index backend.
///
/// Iterators are owned by the backend. Concurrent pops on one iterator are
/// atomic there and yield disjoint file sets.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
pub trait IndexBackend: Send + Sync + std::fmt::Debug {
    /// Enumerate the datasets this backend serves.
    async fn topology(&self) -> Result<Topology, BackendError>;

    /// Run a prefilter query over one dataset, optionally restricted by a
    /// taint tag. The reply's iterator covers `file_count` candidates.
    async fn query(
        &self,
        query: &str,
        taint: &Option<String>,
        dataset: &str,
    ) -> Result<QueryResult, BackendError>;

    /// Atomically pop up to `count` candidate paths off an iterator.
    async fn pop(&self, iterator: &IteratorHandle, count: usize) -> Result<PopResult, BackendError>;
}
