//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "HOLDFAST_LOG";

/// Install the global subscriber.
///
/// Logs go to stderr, or to a daily rolling file under `log_dir` when set.
/// The returned guard must be held until exit so buffered lines are flushed.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Result<Option<WorkerGuard>> {
  let default_level = if verbose { "debug" } else { "info" };
  let env_filter =
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

  match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = RollingFileAppender::new(Rotation::DAILY, dir, "holdfast.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(env_filter)
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(env_filter)
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact(),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

      Ok(None)
    }
  }
}
