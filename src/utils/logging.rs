//! Logging initialization
//!
//! - Respects the RUST_LOG environment variable
//! - Falls back to the filter from the config file
//! - Defaults to "info"
//!
//! Firewall events are emitted under the `firewall` target, so
//! `RUST_LOG=info,firewall=debug` shows every examination decision.
//!
//! # Usage
//! ```rust,no_run
//! use bllvm_connman::utils::init_logging;
//!
//! init_logging(None); // Uses RUST_LOG or defaults to "info"
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter: RUST_LOG wins, then the config filter, then "info".
fn build_env_filter(filter: Option<&str>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or("info"))
}

/// Initialize human-readable logging for the node
///
/// # Arguments
/// * `filter` - Optional log filter from config (e.g., "info", "debug",
///              "bllvm_connman=debug,firewall=trace")
pub fn init_logging(filter: Option<&str>) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(true) // reactor / dispatcher threads are named
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(build_env_filter(filter))
        .init();
}

/// Initialize logging with JSON output (for log aggregation systems)
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(build_env_filter(filter))
        .init();
}

/// Initialize logging from the `logging` section of [`crate::config::NodeConfig`]
pub fn init_logging_from_config(config: Option<&crate::config::LoggingConfig>) {
    let filter = config.and_then(|c| c.filter.as_deref());

    if config.map(|c| c.json_format).unwrap_or(false) {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            init_logging(filter);
        }
    } else {
        init_logging(filter);
    }
}
