use std::{fs, io, path::Path};

use anyhow::Context;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Overrides `--log-level` with a full `EnvFilter` directive.
pub const LOG_ENV: &str = "SARGE_LOG";
pub const LOG_FILE: &str = "sarge.log";

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install tracing: stderr plus a daily rolling `sarge.log` under `log_dir`.
///
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init_tracing(log_dir: &Path, level: &str) -> anyhow::Result<WorkerGuard> {
    // 1) Build an EnvFilter
    let env_filter = filter(level);

    // 2) A plain-text rolling file appender behind a non-blocking writer
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    // 3) Human-readable stderr
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(false);

    // 4) Install subscriber
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(guard)
}

/// Stderr-only logging for commands that run before a home exists.
pub fn init_stderr(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_to_rolling_file() {
        let dir = tempdir().unwrap();
        let guard = init_tracing(dir.path(), "info").unwrap();
        tracing::info!(deployment = "blog", "hello from the test");
        drop(guard);

        let logged: String = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE))
            .map(|e| fs::read_to_string(e.path()).unwrap())
            .collect();
        assert!(logged.contains("hello from the test"));
    }
}
