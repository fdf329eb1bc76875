use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "pipewatch=info";

/// Where log lines go.
pub enum LogTarget {
  Stderr,
  /// Daily rolling files in this directory
  Directory(PathBuf),
}

impl LogTarget {
  /// `$XDG_DATA_HOME/pipewatch/logs`, or stderr when there is no data dir.
  pub fn default_directory() -> Self {
    match dirs::data_dir() {
      Some(dir) => Self::Directory(dir.join("pipewatch").join("logs")),
      None => Self::Stderr,
    }
  }
}

/// Filter from PIPEWATCH_LOG, then RUST_LOG, then the default.
fn env_filter() -> EnvFilter {
  EnvFilter::try_from_env("PIPEWATCH_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive until exit; dropping it flushes and stops
/// the background writer.
pub fn init(target: LogTarget) -> Result<WorkerGuard> {
  let (writer, guard) = match target {
    LogTarget::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    LogTarget::Directory(dir) => {
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(&dir, "pipewatch.log");
      tracing_appender::non_blocking(appender)
    }
  };

  tracing_subscriber::registry()
    .with(env_filter())
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to init logging: {}", e))?;

  Ok(guard)
}
