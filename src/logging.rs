//! Tracing setup for the binary.

use color_eyre::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the log filter (e.g. `offline_engine=debug`).
pub const LOG_ENV: &str = "OFFLINE_ENGINE_LOG";

/// Install the global subscriber: stderr always, plus daily-rolling files
/// under `log_dir` when given. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)?;
      let appender = tracing_appender::rolling::daily(dir, "offline-engine.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .try_init()?;
      Ok(None)
    }
  }
}
