use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::JobId;

/// Opaque cursor over the candidate file list of one (job, dataset) pair.
/// Minted and owned by the index backend; passed by value through tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IteratorHandle(String);

impl IteratorHandle {
    /// Wrap a handle string returned by the backend.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IteratorHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of work delivered to an agent from its group queue.
///
/// The queue carries these as JSON; everything past the store client works
/// with the typed variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentTask {
    /// Claim and query the next dataset of a job.
    Search {
        /// The job to continue searching.
        job: JobId,
    },
    /// Drain one batch from an iterator and scan it.
    Yara {
        /// The job the iterator belongs to.
        job: JobId,
        /// Cursor over the remaining candidate files.
        iterator: IteratorHandle,
    },
    /// Plugin configuration changed; reinitialize before taking more work.
    /// Synthesized by the store, never enqueued by agents.
    Reload,
}

impl AgentTask {
    /// Decode a task from its queue representation.
    pub fn from_wire(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Encode a task for the queue.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
