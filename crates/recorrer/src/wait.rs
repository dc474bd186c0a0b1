//! Polling helpers for synchronization.

use std::time::{Duration, Instant};

use crate::result::{RecorrerError, RecorrerResult};

/// Default wait budget (15 seconds)
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default polling cadence (200ms)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Poll `probe` until it yields a value or the budget runs out.
///
/// The probe returns `Ok(Some(value))` when the condition holds,
/// `Ok(None)` to keep polling. Probe errors propagate immediately.
///
/// # Errors
///
/// Returns [`RecorrerError::Timeout`] when the budget is exhausted.
pub fn wait_until<T, F>(timeout: Duration, interval: Duration, mut probe: F) -> RecorrerResult<T>
where
    F: FnMut() -> RecorrerResult<Option<T>>,
{
    let started = Instant::now();
    loop {
        if let Some(value) = probe()? {
            return Ok(value);
        }
        if started.elapsed() >= timeout {
            return Err(RecorrerError::Timeout {
                ms: timeout.as_millis() as u64,
            });
        }
        std::thread::sleep(interval);
    }
}
