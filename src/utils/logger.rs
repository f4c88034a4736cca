//! Logging setup
//!
//! The interactive shell owns stdout, so diagnostics go to stderr or, with
//! `--log-file`, to a file shared by the controller and its agents.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const STDERR_FILTER: &str = "warn";
const FILE_FILTER: &str = "warn,circle_of_life=info";

/// Initialise the global subscriber once per process.
///
/// # Arguments
/// * `log_level` - filter directive; falls back to `RUST_LOG`, then to a
///   quiet default for stderr or an informative one for a file
/// * `log_file` - append to this file instead of stderr
///
/// # Examples
/// ```no_run
/// use circle_of_life::utils::logger::init_logger;
/// use std::path::PathBuf;
///
/// init_logger(Some("debug"), Some(PathBuf::from("circle.log"))).unwrap();
/// ```
pub fn init_logger(log_level: Option<&str>, log_file: Option<PathBuf>) -> Result<()> {
    let default_filter = if log_file.is_some() {
        FILE_FILTER
    } else {
        STDERR_FILTER
    };
    let env_filter = match log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(std::sync::Arc::new(file))
            .with_target(true)
            .with_ansi(false)
            .with_level(true);

        registry.with(file_layer).try_init()?;
    } else {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true)
            .compact();

        registry.with(stderr_layer).try_init()?;
    }

    tracing::debug!(pid = std::process::id(), "logger initialized");
    Ok(())
}
