use eyre::Result;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    prelude::*,
    Layer,
};

/// Logging level. A "higher level" means more will be logged.
#[derive(Default, Debug, Clone, Copy, serde::Deserialize, PartialOrd, Ord, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Level {
    /// Off
    Off = 0,
    /// Error
    Error = 1,
    /// Warn
    Warn = 2,
    /// Debug
    Debug = 3,
    /// Trace
    Trace = 5,
    /// Trace + Additional logs from dependencies
    DependencyTrace = 6,
    /// Info
    #[serde(other)]
    #[default]
    Info = 4,
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> LevelFilter {
        match level {
            Level::Off => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace | Level::DependencyTrace => LevelFilter::TRACE,
            Level::Info => LevelFilter::INFO,
        }
    }
}

/// Basic output formatting of the fmt subscriber
#[derive(Debug, Clone, Copy, Default, serde::Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Style {
    /// Pretty print
    #[default]
    Pretty,
    /// JSON
    Json,
    /// Compact
    Compact,
    /// Default style
    #[serde(other)]
    Full,
}

/// Configuration for the tracing subscribers used by quarry agents
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub(crate) fmt: Style,
    #[serde(default)]
    pub(crate) level: Level,
}

impl TracingConfig {
    /// Attempt to instantiate and register a tracing subscriber setup from
    /// settings.
    pub fn start_tracing(&self) -> Result<()> {
        let mut target_layer = Targets::new().with_default(self.level);

        if self.level < Level::DependencyTrace {
            // Reduce log noise from trusted libraries that we can reasonably assume are working correctly
            target_layer = target_layer
                .with_target("hyper", Level::Info)
                .with_target("warp", Level::Info)
                .with_target("reqwest", Level::Info)
                .with_target("redis", Level::Debug)
                .with_target("tokio", Level::Debug)
                .with_target("tokio_util", Level::Debug);
        }

        let fmt_layer = match self.fmt {
            Style::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
            Style::Json => tracing_subscriber::fmt::layer().json().boxed(),
            Style::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
            Style::Full => tracing_subscriber::fmt::layer().boxed(),
        };
        let err_layer = tracing_error::ErrorLayer::default();

        let subscriber = tracing_subscriber::Registry::default()
            .with(target_layer)
            .with(fmt_layer)
            .with(err_layer);

        subscriber.try_init()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(serde::Deserialize)]
    struct TestConfig {
        style: Style,
        level: Level,
    }

    #[test]
    fn it_deserializes_config_strings() {
        let case = r#"{"style": "compact", "level": "debug"}"#;
        let cfg: TestConfig = serde_json::from_str(case).unwrap();
        assert_eq!(cfg.style, Style::Compact);
        assert_eq!(cfg.level, Level::Debug);

        // unknown values fall back to the defaults
        let case = r#"{"style": "toast", "level": "verbose"}"#;
        let cfg: TestConfig = serde_json::from_str(case).unwrap();
        assert_eq!(cfg.style, Style::Full);
        assert_eq!(cfg.level, Level::Info);
    }

    #[test]
    fn dependency_trace_is_the_highest_level() {
        assert!(Level::DependencyTrace > Level::Trace);
        assert!(Level::Trace > Level::Info);
        assert!(Level::Info > Level::Warn);
    }
}
