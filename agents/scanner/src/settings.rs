use eyre::Result;
use serde::Deserialize;

use quarry_base::settings::{load_settings_object, Settings};
use quarry_base::LoadableFromSettings;

/// Settings for `scanner`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerSettings {
    #[serde(flatten)]
    base: Settings,
    /// The agent group this scanner serves. Overridden by the first CLI
    /// argument; `"default"` when neither is given.
    #[serde(default)]
    group: Option<String>,
}

impl AsRef<Settings> for ScannerSettings {
    fn as_ref(&self) -> &Settings {
        &self.base
    }
}

impl LoadableFromSettings for ScannerSettings {
    fn load() -> Result<Self> {
        load_settings_object::<Self, &str>("scanner", &[])
    }
}

impl ScannerSettings {
    /// The group this agent belongs to. Use argv if you want a different
    /// group id (it's `default` by default).
    pub fn group_id(&self) -> String {
        std::env::args()
            .nth(1)
            .or_else(|| self.group.clone())
            .unwrap_or_else(|| "default".into())
    }
}
