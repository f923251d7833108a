use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(feature = "test-utils")]
use mockall::automock;

use crate::{AgentTask, IteratorHandle, Job, JobId, MatchInfo, StoreError};

/// Every plugin's declared configuration fields, keyed by plugin name.
/// Includes plugins that failed to activate so the coordinator can still
/// render their configuration UI.
pub type PluginSpec = HashMap<String, Vec<String>>;

/// Contract of the shared job/queue store.
///
/// The store is the single source of truth for all mutable job state; every
/// mutation below is atomic on the store side. Agents hold only ephemeral
/// snapshots.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    /// Block until a task is available on the group queue and return it. If
    /// the stored plugin-config version differs from `version`, a synthetic
    /// [`AgentTask::Reload`] is returned instead of dequeuing work.
    async fn agent_get_task(&self, group: &str, version: u64) -> Result<AgentTask, StoreError>;

    /// Snapshot of the full job record.
    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError>;

    /// Source text of the job's ruleset.
    async fn get_yara_by_job(&self, id: &JobId) -> Result<String, StoreError>;

    /// Record the datasets this group must search for the job and flip the
    /// job from `new` to `processing`. Idempotent: a job already past `new`
    /// is left untouched.
    async fn init_job_datasets(
        &self,
        group: &str,
        id: &JobId,
        datasets: &[String],
    ) -> Result<(), StoreError>;

    /// Atomically claim one dataset that still needs searching, or `None`
    /// when the group has claimed them all.
    async fn get_next_search_dataset(
        &self,
        group: &str,
        id: &JobId,
    ) -> Result<Option<String>, StoreError>;

    /// Atomic `total_files += count`.
    async fn update_job_files(&self, id: &JobId, count: u64) -> Result<(), StoreError>;

    /// Enqueue a YARA task for `(id, iterator)` on the group queue and mark
    /// this group as an active participant of the job.
    async fn agent_start_job(
        &self,
        group: &str,
        id: &JobId,
        iterator: &IteratorHandle,
    ) -> Result<(), StoreError>;

    /// Enqueue a SEARCH task for `id` on the group queue.
    async fn agent_continue_search(&self, group: &str, id: &JobId) -> Result<(), StoreError>;

    /// Atomic `files_in_progress += n`.
    async fn job_start_work(&self, id: &JobId, n: u64) -> Result<(), StoreError>;

    /// Atomic `files_in_progress -= n`, `files_processed += n`,
    /// `num_matches += matches`.
    async fn job_update_work(&self, id: &JobId, n: u64, matches: u64) -> Result<(), StoreError>;

    /// Append a match record. No-op when the job is already terminal.
    async fn add_match(&self, id: &JobId, info: &MatchInfo) -> Result<(), StoreError>;

    /// Mark one participant's work on the job finished. Flips the job to
    /// `done` iff no active participants remain, all files are processed and
    /// the job is still `processing`; the status guard makes the flip
    /// idempotent under concurrent observation.
    async fn agent_finish_job(&self, id: &JobId) -> Result<(), StoreError>;

    /// Set `status = failed` and record the message. Terminal jobs absorb.
    async fn fail_job(&self, id: &JobId, msg: &str) -> Result<(), StoreError>;

    /// Upsert this agent's record. Publishes a new plugin-config version
    /// when the submitted spec differs from the stored one.
    async fn register_active_agent(
        &self,
        group: &str,
        backend_url: &str,
        spec: &PluginSpec,
        active: &[String],
    ) -> Result<(), StoreError>;

    /// Per-plugin configuration map.
    async fn get_plugin_configuration(
        &self,
        name: &str,
    ) -> Result<HashMap<String, String>, StoreError>;

    /// Current plugin-config version counter.
    async fn get_plugin_config_version(&self) -> Result<u64, StoreError>;

    /// Record that a reload of configuration version `version` is in flight
    /// so the rollout is observable while agents converge one by one.
    async fn reload_configuration(&self, version: u64) -> Result<(), StoreError>;
}
