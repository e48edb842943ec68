//! Structured logging for foreman.
//!
//! Log levels follow the usual `tracing` conventions:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected conditions that are recoverable (git cleanup, fetch)
//! - INFO: Plan lifecycle (creation, execution, cancellation, dispatch)
//! - DEBUG: Detailed operation traces
//! - TRACE: Raw agent output and detector state
//!
//! Debug mode can be enabled with `--debug` flag or `FOREMAN_DEBUG=1` env var.
//! `RUST_LOG` always takes precedence when set.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging to ~/.foreman/foreman.log
pub fn init() {
    init_with_debug(false);
}

/// Resolve the filter directive for the given debug setting.
pub fn default_directive(debug: bool) -> &'static str {
    if debug || env_debug() {
        "foreman=debug"
    } else {
        "foreman=info"
    }
}

fn env_debug() -> bool {
    std::env::var("FOREMAN_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn log_path() -> Option<PathBuf> {
    let dir = dirs::home_dir()?.join(".foreman");
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir.join("foreman.log"))
}

/// Initialize logging with explicit debug mode setting.
///
/// The log file is truncated on startup. When the file cannot be created
/// the subscriber falls back to stderr.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let file = log_path().and_then(|path| File::create(path).ok());
    let registry = tracing_subscriber::registry().with(filter);

    let result = match file {
        Some(file) => registry
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init(),
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = result;
}
