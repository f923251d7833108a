use std::collections::HashMap;

use sha2::{Digest, Sha256};

use quarry_core::Metadata;

use super::{MetadataPlugin, PluginError, PluginRegistration};

pub(super) const REGISTRATION: PluginRegistration = PluginRegistration {
    name: "sha256",
    config_fields: &["max_file_size"],
    construct: |config| Ok(Box::new(Sha256Plugin::from_config(config)?)),
};

/// Hex SHA-256 digest of the matched file's contents.
struct Sha256Plugin {
    /// Files larger than this are not hashed. `None` means no limit.
    max_file_size: Option<u64>,
}

impl Sha256Plugin {
    fn from_config(config: &HashMap<String, String>) -> Result<Self, PluginError> {
        let max_file_size = match config
            .get("max_file_size")
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
        {
            None => None,
            Some(raw) => {
                let limit = raw.parse::<u64>().map_err(|_| {
                    PluginError::Config(format!("max_file_size must be an integer, got {raw:?}"))
                })?;
                (limit > 0).then_some(limit)
            }
        };
        Ok(Self { max_file_size })
    }
}

impl MetadataPlugin for Sha256Plugin {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn run(&self, path: &str, _acc: &Metadata) -> Result<Metadata, PluginError> {
        if let Some(limit) = self.max_file_size {
            if std::fs::metadata(path)?.len() > limit {
                return Ok(Metadata::new());
            }
        }
        let contents = std::fs::read(path)?;
        let digest = Sha256::digest(&contents);

        let mut fields = Metadata::new();
        fields.insert("sha256".into(), hex::encode(digest).into());
        Ok(fields)
    }
}
