//! Logging setup.
//!
//! [`init`] installs the global `tracing` subscriber exactly once and hands
//! back a [`LogGuard`]. The entry point owns the guard; dropping it at
//! shutdown flushes anything still buffered by the file writer.

use std::fs;
use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "masterminds_bot.log";

/// Keeps the non-blocking file writer alive. Flushes on drop.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

impl LogGuard {
    /// Whether a file sink is attached.
    pub fn has_file_sink(&self) -> bool {
        self._file.is_some()
    }
}

/// Build the subscriber without installing it: stdout always, plus a
/// daily-rolling file when `config.dir` is set.
pub fn subscriber(
    config: &LogConfig,
) -> io::Result<(impl tracing::Subscriber + Send + Sync + 'static, LogGuard)> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer);

    Ok((subscriber, LogGuard { _file: guard }))
}

/// Install the global subscriber. Fails if one is already set.
pub fn init(config: &LogConfig) -> io::Result<LogGuard> {
    let (subscriber, guard) = subscriber(config)?;
    subscriber.try_init().map_err(io::Error::other)?;

    if let Some(dir) = &config.dir {
        tracing::info!(dir = %dir.display(), file_sink = guard.has_file_sink(), "logging to file");
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_logs(dir: &std::path::Path) -> String {
        let mut out = String::new();
        for entry in fs::read_dir(dir).expect("log dir") {
            let path = entry.expect("entry").path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(LOG_FILE_PREFIX), "unexpected file {name}");
            out.push_str(&fs::read_to_string(&path).expect("readable log"));
        }
        out
    }

    #[test]
    fn stdout_only_without_dir() {
        let (_subscriber, guard) = subscriber(&LogConfig::default()).expect("builds");
        assert!(!guard.has_file_sink());
    }

    #[test]
    fn file_sink_flushes_on_guard_drop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("logs");
        let config = LogConfig {
            filter: "info".to_string(),
            dir: Some(dir.clone()),
        };

        let (subscriber, guard) = subscriber(&config).expect("builds");
        assert!(guard.has_file_sink());
        assert!(dir.is_dir());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(guild = "123", "joined guild");
            tracing::debug!("filtered out");
        });
        drop(guard);

        let logs = read_logs(&dir);
        assert!(logs.contains("joined guild"), "got {logs:?}");
        assert!(logs.contains("guild=\"123\""), "got {logs:?}");
        assert!(!logs.contains("filtered out"));
    }
}
