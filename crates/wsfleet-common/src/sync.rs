use std::sync::Mutex;
use std::sync::MutexGuard;

use tracing::error;

/// Locks `lock`, taking the inner value back if a previous holder panicked.
///
/// Report readers and event sinks only store plain counters and records, so a
/// poisoned guard still holds usable data.
pub fn mutex_lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        error!("Mutex poisoned by a panicking thread; recovering inner value");
        poisoned.into_inner()
    })
}
