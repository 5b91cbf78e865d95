//! Tracing setup for the binary

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "chunkwise=info";
const VERBOSE_LOG_FILTER: &str = "chunkwise=debug";

/// `RUST_LOG` wins when set; otherwise `-v` chooses between info and debug.
pub fn filter_for(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_LOG_FILTER
        } else {
            DEFAULT_LOG_FILTER
        })
    })
}

/// Install a stderr subscriber. Stdout is left to the run report.
pub fn init_logging(verbose: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_filter(filter_for(verbose)),
        )
        .try_init()
        .map_err(|err| anyhow!("Failed to initialize logging: {}", err))
}
