use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use futures_util::future::select_all;
use tokio::task::JoinHandle;
use tracing::{info_span, instrument::Instrumented, Instrument};

use crate::{metrics::CoreMetrics, settings::Settings};

/// Agent-specific settings that embed the shared [`Settings`] block.
///
/// Implementations flatten [`Settings`] into their own struct and pull
/// values from the layered config sources (optional config file, then the
/// `QRY_BASE` and per-agent env prefixes); see
/// [`load_settings_object`](crate::settings::load_settings_object).
pub trait LoadableFromSettings: AsRef<Settings> + Sized {
    /// Load this settings object from the config locations.
    fn load() -> Result<Self>;
}

/// One long-running quarry agent.
///
/// An agent owns every handle it needs (store client, backend client, its
/// caches) directly, so there is no shared core struct to thread through
/// here; the trait only standardizes construction and startup so
/// [`agent_main`] can bring any agent up the same way.
#[async_trait]
pub trait BaseAgent: Send + Sync + Debug {
    /// Name used in logs and metric labels.
    const AGENT_NAME: &'static str;

    /// The agent's settings type.
    type Settings: LoadableFromSettings;

    /// Build the agent from its settings. Fails fast: an agent that cannot
    /// reach its collaborators at startup should not enter the main loop.
    async fn from_settings(settings: Self::Settings, metrics: Arc<CoreMetrics>) -> Result<Self>
    where
        Self: Sized;

    /// Start the agent, consuming it. The returned handle resolves when the
    /// agent stops, which for a healthy agent is never.
    #[allow(clippy::async_yields_async)]
    async fn run(self) -> Instrumented<JoinHandle<Result<()>>>;
}

/// Bring up one agent and run it for its whole lifecycle: settings, metrics
/// registry, tracing subscriber, the agent itself, then the prometheus
/// exporter. Intended to be the entire body of `main`.
pub async fn agent_main<A: BaseAgent>() -> Result<()> {
    let settings = A::Settings::load()?;
    let core_settings: &Settings = settings.as_ref();

    let metrics = core_settings.metrics(A::AGENT_NAME)?;
    core_settings.tracing.start_tracing()?;
    let agent = A::from_settings(settings, metrics.clone()).await?;
    metrics.run_http_server();

    agent.run().await.await?
}

/// Run a set of tasks until the first one finishes, then abort the rest and
/// surface the first outcome.
///
/// An agent's tasks are only useful together; once any of them stops, the
/// process comes down and the supervisor restarts it whole.
#[allow(clippy::unit_arg)]
pub fn run_all(
    tasks: Vec<Instrumented<JoinHandle<Result<()>>>>,
) -> Instrumented<JoinHandle<Result<()>>> {
    debug_assert!(!tasks.is_empty(), "no tasks to run");
    let span = info_span!("run_all");
    tokio::spawn(async move {
        let (outcome, _, rest) = select_all(tasks).await;

        for task in rest {
            let task = task.into_inner();
            task.abort();
            let _ = task.await;
        }

        outcome?
    })
    .instrument(span)
}
