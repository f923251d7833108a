use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use derive_new::new;
use eyre::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, instrument::Instrumented, Instrument};

use quarry_base::{
    backend::HttpIndexBackend, run_all, store::RedisStore, BaseAgent, CoreMetrics,
};
use quarry_core::{AgentTask, IndexBackend, JobId, TaskStore};

use crate::error::TaskError;
use crate::plugins::{plugin_spec, ActivePlugins, MetadataPlugin};
use crate::rules::RuleCache;
use crate::settings::ScannerSettings;

/// Metrics tracked by the scanner's dispatch loop.
#[derive(Clone)]
pub struct ScannerMetrics {
    pub(crate) tasks_processed: IntCounterVec,
    pub(crate) files_scanned: IntCounter,
    pub(crate) matches_found: IntCounter,
    pub(crate) batch_size: Histogram,
}

impl ScannerMetrics {
    /// Bind the agent's metrics to its group.
    pub fn new(metrics: &CoreMetrics, group: &str) -> Self {
        Self {
            tasks_processed: metrics.tasks_processed_count(),
            files_scanned: metrics.files_scanned_count().with_label_values(&[group]),
            matches_found: metrics.matches_found_count().with_label_values(&[group]),
            batch_size: metrics.scan_batch_size().with_label_values(&[group]),
        }
    }
}

/// A scanner agent.
///
/// Every agent belongs to some group. There may be multiple agents in a
/// single group, but they are all interchangeable: they read and write the
/// same queues and they talk to the same index backend. The agent runs one
/// cooperative loop with a single task in flight; all parallelism comes
/// from running more agents against the same group queue.
#[derive(new)]
pub struct Scanner {
    pub(crate) group: String,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) backend: Arc<dyn IndexBackend>,
    pub(crate) backend_url: String,
    pub(crate) metrics: ScannerMetrics,
    #[new(default)]
    pub(crate) plugin_config_version: u64,
    #[new(default)]
    pub(crate) active_plugins: Arc<Vec<Box<dyn MetadataPlugin>>>,
    #[new(default)]
    pub(crate) rules: RuleCache,
}

impl Debug for Scanner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Scanner {{ group: {:?}, backend: {:?}, plugin_config_version: {:?} }}",
            self.group, self.backend_url, self.plugin_config_version
        )
    }
}

#[async_trait]
impl BaseAgent for Scanner {
    const AGENT_NAME: &'static str = "scanner";

    type Settings = ScannerSettings;

    async fn from_settings(settings: Self::Settings, metrics: Arc<CoreMetrics>) -> Result<Self>
    where
        Self: Sized,
    {
        let group = settings.group_id();
        let store = RedisStore::connect(&settings.as_ref().store).await?;
        let backend = HttpIndexBackend::from_url(&settings.as_ref().backend)?;
        let backend_url = backend.url().to_owned();
        let metrics = ScannerMetrics::new(&metrics, &group);
        Ok(Self::new(
            group,
            Arc::new(store),
            Arc::new(backend),
            backend_url,
            metrics,
        ))
    }

    #[allow(clippy::async_yields_async)]
    async fn run(self) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("scanner", group = self.group.as_str());
        let main_loop = tokio::spawn(self.main_loop()).instrument(span);
        run_all(vec![main_loop])
    }
}

impl Scanner {
    /// Pop tasks from the group queue and execute them, forever.
    ///
    /// Task-tier failures are sunk into the affected job; only store
    /// transport failures escape this loop and end the process, leaving the
    /// restart to the supervisor.
    pub async fn main_loop(mut self) -> Result<()> {
        self.initialize().await?;
        info!(group = self.group.as_str(), "agent running");

        loop {
            let task = self
                .store
                .agent_get_task(&self.group, self.plugin_config_version)
                .await?;
            self.process_task(task).await?;
        }
    }

    /// Reload plugins and re-register this agent with the store.
    ///
    /// The registration publishes the full plugin spec plus the names of the
    /// plugins that actually activated, and bumps the stored plugin-config
    /// version when the spec changed. The version is re-read first, so after
    /// a successful registration this agent is current again. Runs at the
    /// start of the main loop and again on every reload.
    pub async fn initialize(&mut self) -> Result<(), TaskError> {
        self.plugin_config_version = self.store.get_plugin_config_version().await?;
        let active = ActivePlugins::load(self.store.as_ref()).await?;
        self.store
            .register_active_agent(
                &self.group,
                &self.backend_url,
                &plugin_spec(),
                &active.names(),
            )
            .await?;
        self.active_plugins = Arc::new(active.plugins);
        Ok(())
    }

    /// Dispatch one incoming task.
    ///
    /// For every new job the coordinator enqueues one SEARCH task per agent
    /// group. Some agent picks it up, claims a dataset and enqueues a YARA
    /// task (plus the next SEARCH); YARA tasks then re-enqueue themselves
    /// until their iterator is exhausted. The queue, not any in-process
    /// loop, is what spreads one job across the whole group.
    pub async fn process_task(&mut self, task: AgentTask) -> Result<()> {
        match task {
            AgentTask::Reload => self.reload().await?,
            AgentTask::Search { job } => {
                info!(%job, "search task");
                let outcome = self.search_task(&job).await;
                self.sink_outcome("search", &job, outcome).await?;
            }
            AgentTask::Yara { job, iterator } => {
                info!(%job, %iterator, "yara task");
                let outcome = self.yara_task(&job, &iterator).await;
                self.sink_outcome("yara", &job, outcome).await?;
            }
        }
        Ok(())
    }

    /// The single sink for task-tier failures: the job is failed and this
    /// agent's participation in it is released. Tasks are never retried;
    /// ruleset and backend failures are not transient and retry storms on a
    /// pathological job would waste the whole group.
    async fn sink_outcome(
        &self,
        task: &str,
        job: &JobId,
        outcome: Result<(), TaskError>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                self.metrics
                    .tasks_processed
                    .with_label_values(&[task, "ok"])
                    .inc();
            }
            Err(err) => {
                error!(%job, %err, "failed to execute task");
                self.metrics
                    .tasks_processed
                    .with_label_values(&[task, "failed"])
                    .inc();
                self.store.agent_finish_job(job).await?;
                self.store.fail_job(job, &err.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        let stored = self.store.get_plugin_config_version().await?;
        if stored == self.plugin_config_version {
            // This should never happen and suggests that the version was
            // not updated properly somewhere.
            error!(
                version = stored,
                "requested to reload configuration, but the stored version is unchanged"
            );
            return Ok(());
        }
        info!("configuration changed - reloading plugins");
        // Hand the reload on before reinitializing. Our own version is
        // updated during reinitialization, so we don't receive our own
        // request.
        self.store
            .reload_configuration(self.plugin_config_version)
            .await?;
        self.initialize().await?;
        Ok(())
    }
}
