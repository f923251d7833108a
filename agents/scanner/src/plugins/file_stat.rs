use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use quarry_core::Metadata;

use super::{MetadataPlugin, PluginError, PluginRegistration};

pub(super) const REGISTRATION: PluginRegistration = PluginRegistration {
    name: "file-stat",
    config_fields: &[],
    construct: |_config| Ok(Box::new(FileStat)),
};

/// Size and modification time of the matched file.
struct FileStat;

impl MetadataPlugin for FileStat {
    fn name(&self) -> &'static str {
        "file-stat"
    }

    fn run(&self, path: &str, _acc: &Metadata) -> Result<Metadata, PluginError> {
        let stat = std::fs::metadata(path)?;
        let mut fields = Metadata::new();
        fields.insert("file_size".into(), stat.len().into());
        if let Ok(modified) = stat.modified() {
            if let Ok(formatted) = OffsetDateTime::from(modified).format(&Rfc3339) {
                fields.insert("modified".into(), formatted.into());
            }
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn reports_size_and_mtime() {
        let mut sample = tempfile::NamedTempFile::new().unwrap();
        sample.write_all(b"sample body").unwrap();

        let plugin = (REGISTRATION.construct)(&Default::default()).unwrap();
        let fields = plugin
            .run(sample.path().to_str().unwrap(), &Metadata::new())
            .unwrap();

        assert_eq!(fields.get("file_size"), Some(&11u64.into()));
        assert!(fields.contains_key("modified"));
    }

    #[test]
    fn missing_files_error_cleanly() {
        let plugin = (REGISTRATION.construct)(&Default::default()).unwrap();
        let err = plugin
            .run("/nonexistent/sample.bin", &Metadata::new())
            .unwrap_err();
        assert!(matches!(err, PluginError::Io(_)));
    }
}
