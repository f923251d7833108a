//! Settings and configuration for quarry agents
//!
//! ## Introduction
//!
//! All agents share the [`Settings`] struct in this crate: the store and
//! backend endpoints, the metrics port and the tracing setup. Each agent
//! then defines any additional settings in its own crate by flattening
//! [`Settings`] into its own struct.
//!
//! ### Configuration
//!
//! Agents read settings from the config files and/or env.
//!
//! Config files are loaded from `./config/<RUN_ENV>/<agent>-partial.json`
//! when present.
//!
//! #### N.B.: Environment variable names correspond 1:1 with cfg file's JSON object hierarchy.
//!
//! In particular, note that any environment variables whose names are
//! prefixed with:
//!
//! * `QRY_BASE`
//!
//! * `QRY_[agentname]`, where `[agentname]` is agent-specific, e.g.
//!   `QRY_SCANNER`
//!
//! will be read as an override to be applied against the hierarchical
//! structure of the configuration provided by the json config file.
//!
//! ### Configuration value precedence
//!
//! Configuration key/value pairs are loaded in the following order, with
//! later sources taking precedence:
//!
//! 1. The config file specified by the `RUN_ENV` env var and the agent's
//!    name. `$RUN_ENV/{agent}-partial.json`
//! 2. Configuration env vars with the prefix `QRY_BASE` intended to be
//!    shared by multiple agents in the same environment
//!    E.g. `export QRY_BASE_STORE=redis://queue-host:6379`
//! 3. Configuration env vars with the prefix `QRY_{agent name}` intended to
//!    be used by a specific agent.
//!    E.g. `export QRY_SCANNER_GROUP=malware-archive`

use std::{collections::HashMap, env, sync::Arc};

use config::{Config, Environment, File};
use eyre::Result;
use prometheus::Registry;
use serde::Deserialize;

use crate::CoreMetrics;

pub use trace::*;

/// Tracing subscriber management
pub mod trace;

/// Load a settings object from the config locations.
///
/// Read settings from the config files and/or env.
///
/// Configs are loaded in the following precedence order:
///
/// 1. The file specified by the `RUN_ENV` env var and the agent's name.
///    `RUN_ENV/<agent_prefix>-partial.json`
/// 2. Configuration env vars with the prefix `QRY_BASE` intended to be
///    shared by multiple agents in the same environment
/// 3. Configuration env vars with the prefix `QRY_<agent_prefix>` intended
///    to be used by a specific agent.
pub fn load_settings_object<'de, T: Deserialize<'de>, S: AsRef<str>>(
    agent_prefix: &str,
    ignore_prefixes: &[S],
) -> Result<T> {
    let env = env::var("RUN_ENV").unwrap_or_else(|_| "default".into());

    // Derive additional prefix from agent name
    let prefix = format!("QRY_{}", agent_prefix).to_ascii_uppercase();

    let filtered_env: HashMap<String, String> = env::vars()
        .filter(|(k, _v)| {
            !ignore_prefixes
                .iter()
                .any(|prefix| k.starts_with(prefix.as_ref()))
        })
        .collect();

    let config_deserializer = Config::builder()
        .add_source(
            File::with_name(&format!(
                "./config/{}/{}-partial",
                env,
                agent_prefix.to_lowercase()
            ))
            .required(false),
        )
        // Use a base configuration env variable prefix
        .add_source(
            Environment::with_prefix("QRY_BASE")
                .separator("_")
                .source(Some(filtered_env.clone())),
        )
        .add_source(
            Environment::with_prefix(&prefix)
                .separator("_")
                .source(Some(filtered_env)),
        )
        .build()?;

    Ok(config_deserializer.try_deserialize()?)
}

/// Settings. Usually this should be treated as a base config and used as
/// follows:
///
/// ```
/// use quarry_base::settings::*;
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// pub struct MySettings {
///     #[serde(flatten)]
///     base_settings: Settings,
///     extra: Option<String>,
/// }
/// ```
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// URL of the shared job/queue store, e.g. `redis://127.0.0.1:6379`
    #[serde(default)]
    pub store: String,
    /// URL of the index backend this agent's group serves. Ideally public,
    /// so the coordinator can collect measurements from it.
    #[serde(default)]
    pub backend: String,
    /// Port to listen on for prometheus scrapes. Kept as a string so it can
    /// be set from an env var; parsed in [`Settings::metrics`].
    pub metrics: Option<String>,
    /// The tracing configuration
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl Settings {
    /// Try to build an agent core metrics object from these settings.
    pub fn metrics(&self, name: &str) -> Result<Arc<CoreMetrics>> {
        Ok(Arc::new(CoreMetrics::new(
            name,
            self.metrics
                .as_ref()
                .map(|port| port.parse::<u16>())
                .transpose()?,
            Registry::new(),
        )?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn settings_deserialize_from_flat_json() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "store": "redis://127.0.0.1:6379",
                "backend": "http://127.0.0.1:9281",
                "metrics": "9090",
                "tracing": {"level": "debug", "fmt": "compact"}
            }"#,
        )
        .unwrap();
        assert_eq!(settings.store, "redis://127.0.0.1:6379");
        assert_eq!(settings.metrics.as_deref(), Some("9090"));
    }
}
