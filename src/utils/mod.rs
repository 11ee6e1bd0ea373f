//! Shared helpers for time, logging, locking and graceful degradation

pub mod error;
pub mod lock;
pub mod logging;
pub mod signal;
pub mod time;

pub use error::{log_error, with_fallback};
pub use lock::{lock_or_recover, try_guard};
pub use logging::{init_logging, init_logging_from_config};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use signal::{create_shutdown_channel, wait_for_shutdown_signal};
pub use time::{current_timestamp, seconds_since};
