use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Stable, opaque key identifying a search job in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wrap an existing key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a job. `new → processing → {done, failed, cancelled}`;
/// `cancelled` is reachable from any non-terminal state; terminal states
/// absorb.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    /// Created by the frontend, not yet touched by any agent.
    New,
    /// At least one agent has started the search phase.
    Processing,
    /// Cancelled by the frontend; observed cooperatively.
    Cancelled,
    /// A task-level error was sunk into the job.
    Failed,
    /// All files of all datasets were processed.
    Done,
}

impl JobStatus {
    /// Whether this status absorbs all further transitions and matches.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Done)
    }
}

/// Snapshot of a job record. The shared store owns the authoritative copy;
/// agents only ever hold this ephemeral view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// The job's key.
    pub id: JobId,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Source text of the YARA ruleset.
    pub raw_yara: String,
    /// Optional dataset-tag filter applied to prefilter queries.
    #[serde(default)]
    pub taint: Option<String>,
    /// Candidate files across all queried datasets. Accumulates as datasets
    /// are claimed; set before any scan task for a dataset is enqueued.
    #[serde(default)]
    pub total_files: u64,
    /// Monotone count of files whose scan completed, `<= total_files`.
    #[serde(default)]
    pub files_processed: u64,
    /// Files popped but not yet accounted by a scan batch.
    #[serde(default)]
    pub files_in_progress: u64,
    /// Monotone count of confirmed matches, `<= files_processed`.
    #[serde(default)]
    pub num_matches: u64,
    /// Failure message, present once `status == failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Files already claimed from this job's iterators, whether or not the
    /// scan for them has completed yet.
    pub fn files_taken(&self) -> u64 {
        self.files_processed + self.files_in_progress
    }
}

/// Key/value annotations attached to a match by metadata plugins.
pub type Metadata = HashMap<String, serde_json::Value>;

/// A single confirmed match. Appended to the store and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchInfo {
    /// Path of the matched file as reported by the backend.
    pub file_path: String,
    /// Plugin-produced annotations; best-effort.
    #[serde(default)]
    pub metadata: Metadata,
    /// Names of the rules that matched.
    pub matching_rule_names: Vec<String>,
}
