//! Logging initialization for the hardware service.
//!
//! Console logging for interactive use, daily-rotated files for deployments.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::utils::error::Result;

/// Initialize the global logger with file or console output.
///
/// `RUST_LOG` takes precedence over the `level` argument when set.
pub fn init_logger(
    log_dir: impl AsRef<Path>,
    service_name: &str,
    level: &str,
    console: bool,
) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if console {
        fmt().with_env_filter(env_filter).init();
        tracing::info!("Logger initialized for service: {} (console mode)", service_name);
    } else {
        std::fs::create_dir_all(&log_dir)?;

        let file_appender = RollingFileAppender::new(
            Rotation::DAILY,
            log_dir,
            format!("{}.log", service_name),
        );

        fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .with_ansi(false)
            .init();

        tracing::info!("Logger initialized for service: {} (file mode)", service_name);
    }

    Ok(())
}
