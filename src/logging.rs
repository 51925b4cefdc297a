//! Operator logging via `tracing` + `tracing-subscriber`.
//!
//! Filter priority:
//! 1. `RUST_LOG` (standard `EnvFilter` syntax)
//! 2. `[logging].filter` from the config
//!
//! Output goes to stderr through a non-blocking writer. Keep the returned
//! guard alive for the life of the process or buffered lines are lost.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Call once from `main`.
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let registry = tracing_subscriber::registry().with(build_filter(config));

    if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()?;
    }
    Ok(guard)
}
