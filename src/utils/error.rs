//! Error handling utilities for graceful degradation
//!
//! Persistence and other off-hot-path work must never take the node down;
//! these helpers log the failure and hand back a usable value.

use tracing::warn;

/// Execute an operation and log errors without failing
///
/// Returns `Some(T)` on success, `None` on error (after logging).
///
/// # Example
/// ```rust
/// use bllvm_connman::utils::log_error;
///
/// let parsed: Option<u32> = log_error(|| "42".parse::<u32>(), "Failed to parse");
/// assert_eq!(parsed, Some(42));
/// ```
pub fn log_error<F, T, E>(operation: F, context: &str) -> Option<T>
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    match operation() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{}: {}", context, e);
            None
        }
    }
}

/// Execute an operation with a fallback on error
///
/// Returns the result of the primary operation on success, or the fallback on error.
/// Logs a warning when fallback is used.
///
/// # Example
/// ```rust
/// use bllvm_connman::utils::with_fallback;
///
/// let value = with_fallback(|| "x".parse::<u32>(), || 7, "Bad value, using default");
/// assert_eq!(value, 7);
/// ```
pub fn with_fallback<F1, F2, T, E>(primary: F1, fallback: F2, context: &str) -> T
where
    F1: FnOnce() -> Result<T, E>,
    F2: FnOnce() -> T,
    E: std::fmt::Display,
{
    match primary() {
        Ok(value) => value,
        Err(e) => {
            warn!("{}: {}", context, e);
            fallback()
        }
    }
}
