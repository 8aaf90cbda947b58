//! Structured logging initialization.
//!
//! The `RUST_LOG` environment variable takes precedence over the level an
//! embedder passes in.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem. Safe to call more than once; later
/// calls are no-ops.
///
/// # Example
///
/// ```ignore
/// server::logging::init("info");
/// tracing::info!("server starting");
/// ```
pub fn init(default_level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_level)
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init();
}
