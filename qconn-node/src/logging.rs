//! Log setup for nodes: stderr always, plus daily files when the config
//! names a directory.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    prelude::*,
    EnvFilter,
};

use crate::config::LogConfig;

/// Overrides the configured level with a full filter, e.g.
/// `QCONN_LOG=qconn_core=trace,warn`.
pub const LOG_ENV: &str = "QCONN_LOG";

const QCONN_CRATES: [&str; 3] = ["qconn_core", "qconn_transport", "qconn_node"];

/// `level` for every qconn crate, `warn` for everything else.
pub fn default_directives(level: &str) -> String {
    QCONN_CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .chain(std::iter::once("warn".to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

fn filter(level: &str) -> anyhow::Result<EnvFilter> {
    let directives = std::env::var(LOG_ENV).unwrap_or_else(|_| default_directives(level));
    Ok(EnvFilter::try_new(directives)?)
}

/// Flushes the file writer when dropped. Hold it for the life of the node.
#[derive(Debug)]
#[must_use = "file logging stops when the guard is dropped"]
pub struct LogGuard {
    file: Option<WorkerGuard>,
}

impl LogGuard {
    pub fn writes_files(&self) -> bool {
        self.file.is_some()
    }
}

/// Installs the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LogGuard> {
    let console = fmt::layer()
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(std::io::stderr);

    let (file, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_writer(writer);
            let layer = if config.json {
                layer.json().boxed()
            } else {
                layer.boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter(&config.level)?)
        .with(console)
        .with(file)
        .try_init()?;

    tracing::info!(dir = ?config.dir, json = config.json, level = %config.level, "logging ready");
    Ok(LogGuard { file: guard })
}

/// Console-only logging for tests. Safe to call more than once.
pub fn init_test_logging() {
    let directives = std::env::var(LOG_ENV).unwrap_or_else(|_| default_directives("trace"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_name_every_crate() {
        let directives = default_directives("info");
        assert_eq!(
            directives,
            "qconn_core=info,qconn_transport=info,qconn_node=info,warn"
        );
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_init_logging_writes_daily_files() {
        let dir = std::env::temp_dir().join(format!("qconn-logs-{}", uuid::Uuid::new_v4()));
        let config = LogConfig {
            dir: Some(dir.clone()),
            file_prefix: "node-test".to_string(),
            json: true,
            ..LogConfig::default()
        };

        let guard = init_logging(&config).unwrap();
        assert!(guard.writes_files());
        tracing::info!(target: "qconn_node", "written to file");
        drop(guard);

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        println!("log files: {:?}", names);
        assert!(names.iter().any(|name| name.starts_with("node-test")));
        let _ = std::fs::remove_dir_all(dir);
    }
}
