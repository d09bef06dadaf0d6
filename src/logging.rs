//! # Logging
//!
//! `tracing` subscriber setup. Injected fixers have no console, so they log to a file next to
//! their module; tools and tests log to stderr. The filter comes from `RUST_LOG` and defaults to
//! `libfix=info`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "libfix=info";

/// `RUST_LOG`, or [`DEFAULT_FILTER`]
fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Logs to `path`, truncating it. Calling this again once a subscriber is installed does nothing.
pub fn init(path: impl AsRef<Path>) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("logging already initialised");
    }
    Ok(())
}

/// Logs to stderr. Calling this again once a subscriber is installed does nothing.
pub fn init_stderr() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("logging already initialised");
    }
}

/// `<module stem>.log` next to the module
pub fn log_path(module_path: &Path) -> PathBuf {
    module_path.with_extension("log")
}
