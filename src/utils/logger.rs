use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;

/// Logging bootstrap for binaries and tests embedding the bus.
///
/// The bus itself only emits `tracing` events; installing a subscriber is
/// the host's job. With `dir` set, output goes to a daily-rolling file under
/// it; otherwise to stdout. Installing twice is harmless, the first
/// subscriber wins.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    /// Maximum level to record (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for rolling log files; stdout when absent.
    #[serde(default)]
    pub dir: Option<String>,
    /// Filename prefix for rolled files.
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl LoggerConfig {
    /// Install the global subscriber. Returns the writer guard that must be
    /// held for as long as file logging should keep flushing.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let level: tracing::Level = self
            .level
            .parse()
            .with_context(|| format!("invalid log level {:?}", self.level))?;

        match self.dir.as_deref() {
            Some(dir) => {
                let prefix = self.prefix.as_deref().unwrap_or("bus");
                let (writer, guard) =
                    tracing_appender::non_blocking(rolling::daily(dir, prefix));
                let _ = tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_writer(writer)
                    .try_init();
                Ok(Some(guard))
            }
            None => {
                let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
                Ok(None)
            }
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
            prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_is_rejected() {
        let config = LoggerConfig {
            level: "loudest".to_string(),
            ..Default::default()
        };
        assert!(config.init().is_err());
    }

    #[test]
    fn stdout_init_needs_no_guard() {
        let guard = LoggerConfig::default().init().unwrap();
        assert!(guard.is_none());
        tracing::info!("logger bootstrap exercised");
    }

    #[test]
    fn file_init_hands_back_a_guard() {
        let dir = std::env::temp_dir().join("astrobus-logger-test");
        std::fs::create_dir_all(&dir).unwrap();
        let config = LoggerConfig {
            level: "debug".to_string(),
            dir: Some(dir.to_string_lossy().into_owned()),
            prefix: Some("astrobus".to_string()),
        };
        let guard = config.init().unwrap();
        assert!(guard.is_some());
    }
}
