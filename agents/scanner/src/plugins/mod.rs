//! Metadata plugins annotate matched files with key/value fields.
//!
//! The set of available plugins is a compile-time registry; which of them
//! actually activate is decided per agent at load time from their stored
//! configuration. Activation and execution are both best-effort: a plugin
//! that fails to construct is skipped, a plugin that fails on one file
//! loses only its own fields for that file.

use std::collections::HashMap;

use tracing::{error, info};

use quarry_core::{Metadata, PluginSpec, StoreError, TaskStore};

mod file_stat;
mod sha256;

/// Failure to construct or run a metadata plugin.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The stored configuration was not usable.
    #[error("invalid plugin configuration: {0}")]
    Config(String),
    /// The plugin could not read the file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A capability producing key/value annotations for matched files.
pub trait MetadataPlugin: Send + Sync {
    /// Short name; also the key of the plugin's stored configuration.
    fn name(&self) -> &'static str;

    /// Extract additional fields for `path`. `acc` holds the fields
    /// produced by plugins earlier in the chain.
    fn run(&self, path: &str, acc: &Metadata) -> Result<Metadata, PluginError>;
}

type Constructor = fn(&HashMap<String, String>) -> Result<Box<dyn MetadataPlugin>, PluginError>;

/// A plugin this binary could activate: static identity plus constructor.
pub struct PluginRegistration {
    /// Plugin name as shown to the coordinator.
    pub name: &'static str,
    /// Configuration fields the plugin understands.
    pub config_fields: &'static [&'static str],
    pub(crate) construct: Constructor,
}

/// Every plugin this binary ships.
pub const METADATA_PLUGINS: &[PluginRegistration] =
    &[file_stat::REGISTRATION, sha256::REGISTRATION];

/// The declared configuration fields of every known plugin, activated or
/// not, so the coordinator can render configuration UIs even for plugins
/// that failed to come up.
pub fn plugin_spec() -> PluginSpec {
    METADATA_PLUGINS
        .iter()
        .map(|plugin| {
            (
                plugin.name.to_owned(),
                plugin.config_fields.iter().map(|f| f.to_string()).collect(),
            )
        })
        .collect()
}

/// The ordered set of plugins that activated successfully.
pub struct ActivePlugins {
    /// Plugins in registry order; matches run them in this order.
    pub plugins: Vec<Box<dyn MetadataPlugin>>,
}

impl ActivePlugins {
    /// Fetch each known plugin's configuration and construct it. Plugins
    /// that fail to come up are logged and skipped, not fatal.
    pub async fn load(store: &dyn TaskStore) -> Result<Self, StoreError> {
        let mut plugins = Vec::new();
        for registration in METADATA_PLUGINS {
            let config = store.get_plugin_configuration(registration.name).await?;
            match (registration.construct)(&config) {
                Ok(plugin) => {
                    info!(plugin = registration.name, "loaded plugin");
                    plugins.push(plugin);
                }
                Err(err) => {
                    error!(plugin = registration.name, %err, "failed to load plugin");
                }
            }
        }
        Ok(Self { plugins })
    }

    /// Names of the activated plugins, for agent registration.
    pub fn names(&self) -> Vec<String> {
        self.plugins
            .iter()
            .map(|plugin| plugin.name().to_owned())
            .collect()
    }
}
