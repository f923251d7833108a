use tracing::{info, instrument, warn};

use quarry_core::{IteratorHandle, Job, JobId, JobStatus, MatchInfo, Metadata};

use crate::error::TaskError;
use crate::plugins::MetadataPlugin;
use crate::scanner::Scanner;

pub(crate) const MIN_BATCH_SIZE: u64 = 10;
pub(crate) const MAX_BATCH_SIZE: u64 = 500;

/// How many files to claim from the iterator for one scan batch.
///
/// Ramps up from small batches so the first matches reach the coordinator
/// quickly, tapers to a quarter of the remaining files so no straggler
/// hoards the tail, and never drops below the floor that keeps backend
/// round-trips worthwhile. The floor is applied last on purpose: near the
/// end of a job it overrides the taper, and on a fresh job it turns the
/// zero ramp-up into the first real batch.
pub(crate) fn batch_size(job: &Job) -> u64 {
    let taken_files = job.files_taken();

    // Never do more than MAX_BATCH_SIZE files at once.
    let mut batch = MAX_BATCH_SIZE;

    // Take small batches of work at first, so results show up quickly.
    batch = batch.min(taken_files);

    // Don't take more than 1/4 of files left at once (to speed up finishes).
    batch = batch.min(job.total_files.saturating_sub(taken_files) / 4);

    // Finally, always claim at least MIN_BATCH_SIZE files.
    batch.max(MIN_BATCH_SIZE)
}

impl Scanner {
    /// Drain one batch from the iterator and scan it.
    ///
    /// If the iterator still has files after the pop, the task is pushed
    /// back onto the queue *before* scanning: that is what lets other
    /// agents work on the tail of the same iterator in parallel.
    #[instrument(skip(self), err)]
    pub(crate) async fn yara_task(
        &mut self,
        job_id: &JobId,
        iterator: &IteratorHandle,
    ) -> Result<(), TaskError> {
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            // Drop the task; the backend garbage-collects the iterator.
            return Ok(());
        }

        let batch = batch_size(&job);
        self.metrics.batch_size.observe(batch as f64);

        let popped = self.backend.pop(iterator, batch as usize).await?;
        if !popped.iterator_empty {
            // The iterator still has some files, put the task back on the
            // queue for the rest of the group.
            self.store
                .agent_start_job(&self.group, job_id, iterator)
                .await?;
        }
        if !popped.files.is_empty() {
            self.execute_rules(job_id, popped.files).await?;
        }

        let job = self.store.get_job(job_id).await?;
        if job.status == JobStatus::Processing && job.files_processed == job.total_files {
            // The job is over, the work of this agent is done.
            self.store.agent_finish_job(job_id).await?;
        }
        Ok(())
    }

    /// Scan a popped batch and account for it.
    ///
    /// Matches are appended before the counters move, so an observer never
    /// sees a fully-processed job whose matches are still in flight.
    async fn execute_rules(&mut self, job_id: &JobId, files: Vec<String>) -> Result<(), TaskError> {
        let rules = self
            .rules
            .get_or_compile(self.store.as_ref(), job_id)
            .await?;
        let count = files.len() as u64;
        self.store.job_start_work(job_id, count).await?;

        let plugins = self.active_plugins.clone();
        let matches = tokio::task::spawn_blocking(move || scan_batch(&rules, &plugins, &files))
            .await
            .map_err(|e| TaskError::ScanWorker(e.to_string()))?;

        let num_matches = matches.len() as u64;
        for info in &matches {
            self.store.add_match(job_id, info).await?;
        }
        self.store
            .job_update_work(job_id, count, num_matches)
            .await?;

        self.metrics.files_scanned.inc_by(count);
        self.metrics.matches_found.inc_by(num_matches);
        info!(files = count, matches = num_matches, "scanned batch");
        Ok(())
    }
}

/// Run the rules over every file of a batch. CPU-bound; runs on the
/// blocking pool.
fn scan_batch(
    rules: &yara_x::Rules,
    plugins: &[Box<dyn MetadataPlugin>],
    files: &[String],
) -> Vec<MatchInfo> {
    let mut scanner = yara_x::Scanner::new(rules);
    let mut matches = Vec::new();
    for path in files {
        let matched: Vec<String> = match scanner.scan_file(path) {
            Ok(results) => results
                .matching_rules()
                .map(|rule| rule.identifier().to_owned())
                .collect(),
            Err(err) => {
                // One corrupt sample must not sink a million-file job. The
                // file still counts as processed, just not as a match.
                warn!(path = path.as_str(), %err, "scan failed, skipping file");
                continue;
            }
        };
        if matched.is_empty() {
            continue;
        }
        matches.push(MatchInfo {
            file_path: path.clone(),
            metadata: run_plugins(plugins, path),
            matching_rule_names: matched,
        });
    }
    matches
}

/// Collect metadata for one matched file. Each plugin sees the fields
/// accumulated so far; a failing plugin loses only its own fields.
fn run_plugins(plugins: &[Box<dyn MetadataPlugin>], path: &str) -> Metadata {
    let mut metadata = Metadata::new();
    for plugin in plugins {
        match plugin.run(path, &metadata) {
            Ok(fields) => metadata.extend(fields),
            Err(err) => {
                warn!(plugin = plugin.name(), path, %err, "metadata plugin failed");
            }
        }
    }
    metadata
}
