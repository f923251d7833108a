use tracing::{info, instrument};

use quarry_core::{JobId, JobStatus};

use crate::error::TaskError;
use crate::query::{combine_rules, parse_rules};
use crate::scanner::Scanner;

impl Scanner {
    /// Run the prefilter query for one dataset of the job.
    ///
    /// The first search task of a fresh job asks the backend for its
    /// topology and records the datasets still to cover; every search task
    /// then claims one dataset, queries it, enqueues a YARA task for the
    /// resulting iterator and re-enqueues a SEARCH task for the next
    /// dataset. The re-enqueue, rather than an in-process loop, is what
    /// lets other agents in the group pick up the remaining datasets.
    #[instrument(skip(self), err)]
    pub(crate) async fn search_task(&self, job_id: &JobId) -> Result<(), TaskError> {
        let job = self.store.get_job(job_id).await?;
        if job.status == JobStatus::Cancelled {
            info!("job was cancelled, returning");
            return Ok(());
        }

        if job.status == JobStatus::New {
            // First search request - find datasets to query.
            info!("new job, generating subtasks");
            let topology = self.backend.topology().await?;
            let datasets: Vec<String> = topology.datasets.into_keys().collect();
            self.store
                .init_job_datasets(&self.group, job_id, &datasets)
                .await?;
        }

        let Some(dataset) = self
            .store
            .get_next_search_dataset(&self.group, job_id)
            .await?
        else {
            info!("nothing left to query, returning");
            return Ok(());
        };

        let rules = parse_rules(&job.raw_yara)?;
        let query = combine_rules(&rules).to_query();

        let result = self.backend.query(&query, &job.taint, &dataset).await?;
        info!(
            iterator = %result.iterator,
            files = result.file_count,
            dataset = dataset.as_str(),
            "queried dataset"
        );

        self.store
            .update_job_files(job_id, result.file_count)
            .await?;
        self.store
            .agent_start_job(&self.group, job_id, &result.iterator)
            .await?;
        self.store.agent_continue_search(&self.group, job_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use mockall::predicate::eq;
    use prometheus::Registry;

    use quarry_core::{
        IteratorHandle, Job, JobId, JobStatus, MockIndexBackend, MockTaskStore, QueryResult,
        Topology,
    };

    use crate::scanner::{Scanner, ScannerMetrics};
    use quarry_base::CoreMetrics;

    fn test_metrics() -> ScannerMetrics {
        let core = CoreMetrics::new("scanner", None, Registry::new()).unwrap();
        ScannerMetrics::new(&core, "default")
    }

    fn job(status: JobStatus) -> Job {
        Job {
            id: JobId::new("j1"),
            status,
            raw_yara: "rule marker { strings: $a = \"alpha-marker\" condition: $a }".into(),
            taint: None,
            total_files: 0,
            files_processed: 0,
            files_in_progress: 0,
            num_matches: 0,
            error: None,
        }
    }

    fn scanner(store: MockTaskStore, backend: MockIndexBackend) -> Scanner {
        Scanner::new(
            "default".into(),
            Arc::new(store),
            Arc::new(backend),
            "http://backend:9281".into(),
            test_metrics(),
        )
    }

    #[tokio::test]
    async fn new_job_initializes_datasets_and_fans_out() {
        let mut store = MockTaskStore::new();
        let mut backend = MockIndexBackend::new();

        store
            .expect_get_job()
            .returning(|_| Ok(job(JobStatus::New)));
        backend.expect_topology().times(1).returning(|| {
            Ok(serde_json::from_str::<Topology>(r#"{"datasets": {"set-a": {}, "set-b": {}}}"#)
                .unwrap())
        });
        store
            .expect_init_job_datasets()
            .withf(|group, _, datasets| group == "default" && datasets.len() == 2)
            .times(1)
            .returning(|_, _, _| Ok(()));
        store
            .expect_get_next_search_dataset()
            .times(1)
            .returning(|_, _| Ok(Some("set-a".into())));
        backend
            .expect_query()
            .withf(|query, taint, dataset| {
                query == r#""alpha-marker""# && taint.is_none() && dataset == "set-a"
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(QueryResult {
                    file_count: 40,
                    iterator: IteratorHandle::new("it-1"),
                })
            });
        store
            .expect_update_job_files()
            .with(eq(JobId::new("j1")), eq(40))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_agent_start_job()
            .withf(|group, _, iterator| group == "default" && iterator.as_str() == "it-1")
            .times(1)
            .returning(|_, _, _| Ok(()));
        store
            .expect_agent_continue_search()
            .times(1)
            .returning(|_, _| Ok(()));

        scanner(store, backend)
            .search_task(&JobId::new("j1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_jobs_are_skipped() {
        let mut store = MockTaskStore::new();
        store
            .expect_get_job()
            .returning(|_| Ok(job(JobStatus::Cancelled)));

        let backend = MockIndexBackend::new();
        // No other store or backend call is expected.
        scanner(store, backend)
            .search_task(&JobId::new("j1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_datasets_end_the_search_phase() {
        let mut store = MockTaskStore::new();
        store
            .expect_get_job()
            .returning(|_| Ok(job(JobStatus::Processing)));
        store
            .expect_get_next_search_dataset()
            .times(1)
            .returning(|_, _| Ok(None));

        scanner(store, MockIndexBackend::new())
            .search_task(&JobId::new("j1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backend_errors_fail_the_task() {
        let mut store = MockTaskStore::new();
        let mut backend = MockIndexBackend::new();

        store
            .expect_get_job()
            .returning(|_| Ok(job(JobStatus::Processing)));
        store
            .expect_get_next_search_dataset()
            .returning(|_, _| Ok(Some("set-a".into())));
        backend.expect_query().returning(|_, _, _| {
            Err(quarry_core::BackendError::Api("index corrupted".into()))
        });

        let err = scanner(store, backend)
            .search_task(&JobId::new("j1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("index corrupted"));
    }
}
