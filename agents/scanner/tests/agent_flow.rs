//! End-to-end dispatcher scenarios: a scanner (or several) draining a real
//! task queue against an in-memory store and backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prometheus::Registry;

use quarry_base::CoreMetrics;
use quarry_core::{
    AgentTask, BackendError, IndexBackend, IteratorHandle, Job, JobId, JobStatus, MatchInfo,
    PluginSpec, PopResult, QueryResult, StoreError, TaskStore, Topology,
};
use scanner::{Scanner, ScannerMetrics};

const MARKER_RULE: &str = r#"
    rule RedMarker {
        strings:
            $a = "red-marker"
        condition:
            $a
    }
"#;

#[derive(Debug)]
struct JobRecord {
    status: JobStatus,
    raw_yara: String,
    taint: Option<String>,
    total_files: u64,
    files_processed: u64,
    files_in_progress: u64,
    num_matches: u64,
    error: Option<String>,
    agents_left: i64,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            status: JobStatus::New,
            raw_yara: String::new(),
            taint: None,
            total_files: 0,
            files_processed: 0,
            files_in_progress: 0,
            num_matches: 0,
            error: None,
            agents_left: 0,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, JobRecord>,
    queue: VecDeque<AgentTask>,
    datasets: HashMap<String, Vec<String>>,
    groups_active: HashSet<String>,
    matches: Vec<MatchInfo>,
    plugin_version: u64,
    reload_marker: Option<u64>,
    registered_specs: Vec<PluginSpec>,
}

/// In-memory stand-in for the shared store, with the same atomicity
/// contracts (every mutation happens under one lock).
#[derive(Debug, Clone, Default)]
struct FakeStore(Arc<Mutex<State>>);

impl FakeStore {
    fn seed_job(&self, id: &JobId, raw_yara: &str) {
        let mut state = self.0.lock().unwrap();
        state.jobs.insert(
            id.clone(),
            JobRecord {
                status: JobStatus::New,
                raw_yara: raw_yara.to_owned(),
                ..Default::default()
            },
        );
        state.queue.push_back(AgentTask::Search { job: id.clone() });
    }

    fn pop_task(&self) -> Option<AgentTask> {
        self.0.lock().unwrap().queue.pop_front()
    }

    fn job(&self, id: &JobId) -> Job {
        let state = self.0.lock().unwrap();
        let record = &state.jobs[id];
        Job {
            id: id.clone(),
            status: record.status,
            raw_yara: record.raw_yara.clone(),
            taint: record.taint.clone(),
            total_files: record.total_files,
            files_processed: record.files_processed,
            files_in_progress: record.files_in_progress,
            num_matches: record.num_matches,
            error: record.error.clone(),
        }
    }

    fn matches(&self) -> Vec<MatchInfo> {
        self.0.lock().unwrap().matches.clone()
    }
}

#[async_trait]
impl TaskStore for FakeStore {
    async fn agent_get_task(&self, _group: &str, version: u64) -> Result<AgentTask, StoreError> {
        let mut state = self.0.lock().unwrap();
        if state.plugin_version != version {
            return Ok(AgentTask::Reload);
        }
        state
            .queue
            .pop_front()
            .ok_or_else(|| StoreError::Decode("queue drained".into()))
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        let state = self.0.lock().unwrap();
        if !state.jobs.contains_key(id) {
            return Err(StoreError::UnknownJob(id.to_string()));
        }
        drop(state);
        Ok(self.job(id))
    }

    async fn get_yara_by_job(&self, id: &JobId) -> Result<String, StoreError> {
        Ok(self.job(id).raw_yara)
    }

    async fn init_job_datasets(
        &self,
        group: &str,
        id: &JobId,
        datasets: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        if state.jobs.get(id).map(|record| record.status) == Some(JobStatus::New) {
            state.jobs.get_mut(id).unwrap().status = JobStatus::Processing;
            state.datasets.insert(group.to_owned(), datasets.to_vec());
        }
        Ok(())
    }

    async fn get_next_search_dataset(
        &self,
        group: &str,
        _id: &JobId,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .datasets
            .get_mut(group)
            .and_then(|datasets| datasets.pop()))
    }

    async fn update_job_files(&self, id: &JobId, count: u64) -> Result<(), StoreError> {
        self.0.lock().unwrap().jobs.get_mut(id).unwrap().total_files += count;
        Ok(())
    }

    async fn agent_start_job(
        &self,
        group: &str,
        id: &JobId,
        iterator: &IteratorHandle,
    ) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        if state.groups_active.insert(group.to_owned()) {
            state.jobs.get_mut(id).unwrap().agents_left += 1;
        }
        state.queue.push_back(AgentTask::Yara {
            job: id.clone(),
            iterator: iterator.clone(),
        });
        Ok(())
    }

    async fn agent_continue_search(&self, _group: &str, id: &JobId) -> Result<(), StoreError> {
        self.0
            .lock()
            .unwrap()
            .queue
            .push_back(AgentTask::Search { job: id.clone() });
        Ok(())
    }

    async fn job_start_work(&self, id: &JobId, n: u64) -> Result<(), StoreError> {
        self.0
            .lock()
            .unwrap()
            .jobs
            .get_mut(id)
            .unwrap()
            .files_in_progress += n;
        Ok(())
    }

    async fn job_update_work(&self, id: &JobId, n: u64, matches: u64) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        let record = state.jobs.get_mut(id).unwrap();
        record.files_in_progress -= n;
        record.files_processed += n;
        record.num_matches += matches;
        Ok(())
    }

    async fn add_match(&self, id: &JobId, info: &MatchInfo) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        if !state.jobs[id].status.is_terminal() {
            state.matches.push(info.clone());
        }
        Ok(())
    }

    async fn agent_finish_job(&self, id: &JobId) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        let record = state.jobs.get_mut(id).unwrap();
        record.agents_left = (record.agents_left - 1).max(0);
        if record.agents_left == 0
            && record.status == JobStatus::Processing
            && record.files_processed == record.total_files
        {
            record.status = JobStatus::Done;
        }
        Ok(())
    }

    async fn fail_job(&self, id: &JobId, msg: &str) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        let record = state.jobs.get_mut(id).unwrap();
        if !record.status.is_terminal() {
            record.status = JobStatus::Failed;
            record.error = Some(msg.to_owned());
        }
        Ok(())
    }

    async fn register_active_agent(
        &self,
        _group: &str,
        _backend_url: &str,
        spec: &PluginSpec,
        _active: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.0.lock().unwrap();
        if state.registered_specs.last() != Some(spec) {
            state.plugin_version += 1;
        }
        state.registered_specs.push(spec.clone());
        Ok(())
    }

    async fn get_plugin_configuration(
        &self,
        _name: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        Ok(HashMap::new())
    }

    async fn get_plugin_config_version(&self) -> Result<u64, StoreError> {
        Ok(self.0.lock().unwrap().plugin_version)
    }

    async fn reload_configuration(&self, version: u64) -> Result<(), StoreError> {
        self.0.lock().unwrap().reload_marker = Some(version);
        Ok(())
    }
}

/// In-memory index backend: dataset name → candidate files, iterators with
/// atomic disjoint pops.
#[derive(Debug, Clone, Default)]
struct FakeBackend {
    datasets: Arc<Mutex<HashMap<String, Vec<String>>>>,
    iterators: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    minted: Arc<AtomicUsize>,
}

impl FakeBackend {
    fn seed_dataset(&self, name: &str, files: Vec<String>) {
        self.datasets.lock().unwrap().insert(name.to_owned(), files);
    }
}

#[async_trait]
impl IndexBackend for FakeBackend {
    async fn topology(&self) -> Result<Topology, BackendError> {
        Ok(Topology {
            datasets: self
                .datasets
                .lock()
                .unwrap()
                .keys()
                .map(|name| (name.clone(), serde_json::Value::Null))
                .collect(),
        })
    }

    async fn query(
        &self,
        _query: &str,
        _taint: &Option<String>,
        dataset: &str,
    ) -> Result<QueryResult, BackendError> {
        let files = self
            .datasets
            .lock()
            .unwrap()
            .get(dataset)
            .cloned()
            .ok_or_else(|| BackendError::Api(format!("unknown dataset {dataset}")))?;
        let handle = format!("it-{}", self.minted.fetch_add(1, Ordering::SeqCst));
        let count = files.len() as u64;
        self.iterators
            .lock()
            .unwrap()
            .insert(handle.clone(), files.into());
        Ok(QueryResult {
            file_count: count,
            iterator: IteratorHandle::new(handle),
        })
    }

    async fn pop(
        &self,
        iterator: &IteratorHandle,
        count: usize,
    ) -> Result<PopResult, BackendError> {
        let mut iterators = self.iterators.lock().unwrap();
        let pending = iterators
            .get_mut(iterator.as_str())
            .ok_or_else(|| BackendError::Api("expired iterator".into()))?;
        let take = count.min(pending.len());
        let files: Vec<String> = pending.drain(..take).collect();
        Ok(PopResult {
            files,
            iterator_empty: pending.is_empty(),
        })
    }
}

fn test_scanner(store: &FakeStore, backend: &FakeBackend) -> Scanner {
    let core = CoreMetrics::new("scanner", None, Registry::new()).unwrap();
    Scanner::new(
        "default".into(),
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        "http://backend:9281".into(),
        ScannerMetrics::new(&core, "default"),
    )
}

/// Write `total` sample files into `dir`, `hits` of which contain the
/// marker the ruleset looks for. Returns (all paths, hit paths).
fn seed_samples(dir: &tempfile::TempDir, total: usize, hits: usize) -> (Vec<String>, Vec<String>) {
    let mut all = Vec::with_capacity(total);
    let mut matching = Vec::new();
    for i in 0..total {
        let path = dir.path().join(format!("sample-{i:04}.bin"));
        let mut file = std::fs::File::create(&path).unwrap();
        if i < hits {
            file.write_all(b"prefix red-marker suffix").unwrap();
        } else {
            file.write_all(b"benign contents").unwrap();
        }
        let path = path.to_string_lossy().into_owned();
        if i < hits {
            matching.push(path.clone());
        }
        all.push(path);
    }
    (all, matching)
}

#[tokio::test]
async fn happy_path_one_dataset_three_matches() {
    let dir = tempfile::tempdir().unwrap();
    let (files, expected_hits) = seed_samples(&dir, 100, 3);

    let store = FakeStore::default();
    let backend = FakeBackend::default();
    backend.seed_dataset("set-a", files);

    let job = JobId::new("j1");
    store.seed_job(&job, MARKER_RULE);

    let mut agent = test_scanner(&store, &backend);
    agent.initialize().await.unwrap();
    while let Some(task) = store.pop_task() {
        agent.process_task(task).await.unwrap();
    }

    let job = store.job(&JobId::new("j1"));
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.total_files, 100);
    assert_eq!(job.files_processed, 100);
    assert_eq!(job.files_in_progress, 0);
    assert_eq!(job.num_matches, 3);

    let mut matched: Vec<String> = store
        .matches()
        .into_iter()
        .map(|info| info.file_path)
        .collect();
    matched.sort();
    assert_eq!(matched, expected_hits);
    for info in store.matches() {
        assert_eq!(info.matching_rule_names, vec!["RedMarker".to_owned()]);
        // plugin-enriched metadata rides along with every match
        assert!(info.metadata.contains_key("sha256"));
        assert!(info.metadata.contains_key("file_size"));
    }
}

#[tokio::test]
async fn two_datasets_accumulate_their_totals() {
    let dir = tempfile::tempdir().unwrap();
    let (files, _) = seed_samples(&dir, 100, 2);

    let store = FakeStore::default();
    let backend = FakeBackend::default();
    backend.seed_dataset("set-a", files[..40].to_vec());
    backend.seed_dataset("set-b", files[40..].to_vec());

    let job = JobId::new("j1");
    store.seed_job(&job, MARKER_RULE);

    let mut agent = test_scanner(&store, &backend);
    while let Some(task) = store.pop_task() {
        agent.process_task(task).await.unwrap();
    }

    let job = store.job(&JobId::new("j1"));
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.total_files, 100);
    assert_eq!(job.files_processed, 100);
    assert_eq!(job.num_matches, 2);
}

#[tokio::test]
async fn two_agents_split_one_iterator() {
    let dir = tempfile::tempdir().unwrap();
    let (files, _) = seed_samples(&dir, 120, 5);

    let store = FakeStore::default();
    let backend = FakeBackend::default();
    backend.seed_dataset("set-a", files);

    let job = JobId::new("j1");
    store.seed_job(&job, MARKER_RULE);

    let mut first = test_scanner(&store, &backend);
    let mut second = test_scanner(&store, &backend);

    // Interleave the two agents over the shared queue.
    let mut turn = 0;
    while let Some(task) = store.pop_task() {
        let agent = if turn % 2 == 0 { &mut first } else { &mut second };
        agent.process_task(task).await.unwrap();
        turn += 1;
    }

    let job = store.job(&JobId::new("j1"));
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.files_processed, 120);
    assert_eq!(job.files_in_progress, 0);
    assert_eq!(job.num_matches, 5);
}

#[tokio::test]
async fn empty_dataset_completes_without_scanning() {
    let store = FakeStore::default();
    let backend = FakeBackend::default();
    backend.seed_dataset("set-a", Vec::new());

    let job = JobId::new("j1");
    store.seed_job(&job, MARKER_RULE);

    let mut agent = test_scanner(&store, &backend);
    while let Some(task) = store.pop_task() {
        agent.process_task(task).await.unwrap();
    }

    let job = store.job(&JobId::new("j1"));
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.total_files, 0);
    assert_eq!(job.num_matches, 0);
    assert!(store.matches().is_empty());
}

#[tokio::test]
async fn uncompilable_ruleset_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let (files, _) = seed_samples(&dir, 10, 1);

    let store = FakeStore::default();
    let backend = FakeBackend::default();
    backend.seed_dataset("set-a", files);

    // Lenient enough for the prefilter, rejected by the compiler.
    let job = JobId::new("j1");
    store.seed_job(&job, "rule broken { condition: undefined_thing }");

    let mut agent = test_scanner(&store, &backend);
    while let Some(task) = store.pop_task() {
        agent.process_task(task).await.unwrap();
    }

    let job = store.job(&JobId::new("j1"));
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("yara compile error"));
    assert!(store.matches().is_empty());
}

#[tokio::test]
async fn reload_protocol_converges_and_marks_the_handoff() {
    let store = FakeStore::default();
    store.0.lock().unwrap().plugin_version = 5;

    let mut agent = test_scanner(&store, &FakeBackend::default());

    // Cached version 0 vs stored 5: a real reload. The agent hands the
    // reload on, then re-registers; the first registration publishes a new
    // spec and bumps the version once more.
    agent.process_task(AgentTask::Reload).await.unwrap();
    assert_eq!(store.0.lock().unwrap().reload_marker, Some(0));
    assert_eq!(store.0.lock().unwrap().registered_specs.len(), 1);
    assert_eq!(store.0.lock().unwrap().plugin_version, 6);

    // Cached 5 vs stored 6: still a real reload; this time the spec is
    // unchanged so the version stays put and the agent is current.
    agent.process_task(AgentTask::Reload).await.unwrap();
    assert_eq!(store.0.lock().unwrap().registered_specs.len(), 2);
    assert_eq!(store.0.lock().unwrap().plugin_version, 6);

    // Spurious reload: stored version equals the cached one. Logged and
    // ignored, no re-registration.
    agent.process_task(AgentTask::Reload).await.unwrap();
    assert_eq!(store.0.lock().unwrap().registered_specs.len(), 2);
}
