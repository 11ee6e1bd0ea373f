//! Non-blocking lock helpers
//!
//! The reactor and the dispatcher never wait on a per-peer lock. A contended
//! lock means "skip this peer for the current tick", so every cross-thread
//! acquisition goes through [`try_guard`].

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::warn;

/// Try to take a mutex without blocking.
///
/// Returns `None` when another thread holds the lock. A poisoned lock is
/// recovered: the data it guards is plain buffers and counters that stay
/// consistent even if a holder panicked.
pub fn try_guard<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::WouldBlock) => None,
        Err(TryLockError::Poisoned(poisoned)) => {
            warn!("Recovering poisoned peer lock");
            Some(poisoned.into_inner())
        }
    }
}

/// Take a short-lived mutex that is never held across I/O, recovering poison.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
