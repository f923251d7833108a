//! Useful metrics that all agents should track.

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::{
    histogram_opts, labels, opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, Encoder, HistogramVec, IntCounterVec, Registry,
    TextEncoder,
};
use tokio::task::JoinHandle;

/// The metrics namespace prefix. All metric names will start with
/// `{NAMESPACE}_`.
pub const NAMESPACE: &str = "quarry";

/// Macro to prefix a string with the namespace.
macro_rules! namespaced {
    ($name:expr) => {
        format!("{}_{}", NAMESPACE, $name)
    };
}

/// Metrics for a particular agent
pub struct CoreMetrics {
    /// Metrics registry used to gather reports
    registry: Registry,
    listen_port: Option<u16>,

    tasks_processed_count: IntCounterVec,
    files_scanned_count: IntCounterVec,
    matches_found_count: IntCounterVec,
    scan_batch_size: HistogramVec,
}

impl CoreMetrics {
    /// Track metrics for a particular agent name.
    ///
    /// - `for_agent` name of the agent these metrics are tracking.
    /// - `listen_port` port to start the HTTP server on. If None the server
    ///   will not be started.
    /// - `registry` prometheus registry to attach the metrics to
    pub fn new(
        for_agent: &str,
        listen_port: Option<u16>,
        registry: Registry,
    ) -> prometheus::Result<Self> {
        let const_labels: HashMap<String, String> = labels! {
            namespaced!("baselib_version") => env!("CARGO_PKG_VERSION").into(),
            "agent".into() => for_agent.into(),
        };
        let const_labels_ref = const_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<HashMap<_, _>>();

        let tasks_processed_count = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("tasks_processed_count"),
                "Number of queue tasks processed by this agent",
                const_labels_ref
            ),
            &["task", "outcome"],
            registry
        )?;

        let files_scanned_count = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("files_scanned_count"),
                "Number of candidate files run through the rule engine",
                const_labels_ref
            ),
            &["group"],
            registry
        )?;

        let matches_found_count = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("matches_found_count"),
                "Number of files confirmed as matches",
                const_labels_ref
            ),
            &["group"],
            registry
        )?;

        let scan_batch_size = register_histogram_vec_with_registry!(
            histogram_opts!(
                namespaced!("scan_batch_size"),
                "Distribution of adaptive batch sizes claimed from iterators",
                vec![10.0, 25.0, 50.0, 100.0, 250.0, 500.0],
                const_labels.clone()
            ),
            &["group"],
            registry
        )?;

        Ok(Self {
            registry,
            listen_port,

            tasks_processed_count,
            files_scanned_count,
            matches_found_count,
            scan_batch_size,
        })
    }

    /// Number of queue tasks processed, labeled by task type and outcome
    /// (`ok`, `failed`, `dropped`).
    pub fn tasks_processed_count(&self) -> IntCounterVec {
        self.tasks_processed_count.clone()
    }

    /// Number of candidate files run through the rule engine per group.
    pub fn files_scanned_count(&self) -> IntCounterVec {
        self.files_scanned_count.clone()
    }

    /// Number of files confirmed as matches per group.
    pub fn matches_found_count(&self) -> IntCounterVec {
        self.matches_found_count.clone()
    }

    /// Distribution of adaptive batch sizes claimed from iterators.
    pub fn scan_batch_size(&self) -> HistogramVec {
        self.scan_batch_size.clone()
    }

    /// Gather all metrics into an encoded (plaintext, OpenMetrics format)
    /// report.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(1024 * 64);
        let encoder = TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }

    /// Run an HTTP server serving OpenMetrics format reports on `/metrics`
    ///
    /// This is compatible with Prometheus, which ought to be configured to
    /// scrape me!
    pub fn run_http_server(self: Arc<CoreMetrics>) -> JoinHandle<()> {
        use warp::Filter;
        if let Some(port) = self.listen_port {
            tracing::info!(port, "starting prometheus server on 0.0.0.0:{port}");
            tokio::spawn(async move {
                warp::serve(
                    warp::path!("metrics")
                        .map(move || {
                            warp::reply::with_header(
                                self.gather().expect("failed to encode metrics"),
                                "Content-Type",
                                "text/plain; charset=utf-8",
                            )
                        })
                        .or(warp::any().map(|| {
                            warp::reply::with_status(
                                "go look at /metrics",
                                warp::http::StatusCode::NOT_FOUND,
                            )
                        })),
                )
                .run(([0, 0, 0, 0], port))
                .await;
            })
        } else {
            tracing::info!("not starting prometheus server");
            tokio::spawn(std::future::ready(()))
        }
    }
}

impl std::fmt::Debug for CoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoreMetrics {{ listen_port: {:?} }}", self.listen_port)
    }
}
