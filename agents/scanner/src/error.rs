use quarry_core::{BackendError, StoreError};

/// Errors that can fail a single queue task.
///
/// These never escape the dispatcher: the task sink turns any of them into
/// `agent_finish_job` + `fail_job` on the affected job. Per-file scan
/// failures are not represented here; they are logged and swallowed in the
/// scan loop.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// A store operation inside a handler failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A backend operation failed or answered with an error object.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The ruleset could not be parsed into a prefilter query.
    #[error("invalid ruleset: {0}")]
    RuleParse(String),
    /// The ruleset did not compile.
    #[error("yara compile error: {0}")]
    RuleCompile(String),
    /// The blocking scan worker died.
    #[error("scan worker crashed: {0}")]
    ScanWorker(String),
}
