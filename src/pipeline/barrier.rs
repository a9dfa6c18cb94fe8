//! Completion barrier between phases

use crate::io::configuration::{BARRIER_POLL_INTERVAL_MS, BARRIER_TIMEOUT_SECS};
use crate::io::error::{AlignError, Result};
use crate::pipeline::queue::TaskQueue;
use crate::store::markers::MarkerStore;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long and how often to poll for markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierConfig {
    /// Give up after this long
    pub timeout: Duration,
    /// Pause between marker counts
    pub poll_interval: Duration,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(BARRIER_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(BARRIER_POLL_INTERVAL_MS),
        }
    }
}

impl BarrierConfig {
    /// Barrier with an explicit timeout and poll interval
    pub const fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// Block until `expected` markers exist under `prefix`
///
/// `on_poll` runs after every count with the number found so far; an error
/// from it aborts the wait. Returns the final count.
///
/// # Errors
///
/// Returns [`AlignError::BarrierTimeout`] when the markers do not all appear
/// within `config.timeout`, or the first error from the marker store or
/// `on_poll`
pub fn wait_for_markers(
    markers: &dyn MarkerStore,
    prefix: &str,
    expected: usize,
    config: &BarrierConfig,
    mut on_poll: impl FnMut(usize) -> Result<()>,
) -> Result<usize> {
    let started = Instant::now();
    loop {
        let found = markers.count_markers(prefix)?;
        on_poll(found)?;
        if found >= expected {
            debug!(prefix, found, "barrier passed");
            return Ok(found);
        }
        let waited = started.elapsed();
        if waited >= config.timeout {
            warn!(prefix, expected, found, "barrier timed out");
            return Err(AlignError::BarrierTimeout {
                prefix: prefix.to_string(),
                expected,
                found,
                waited,
            });
        }
        std::thread::sleep(config.poll_interval.min(config.timeout.saturating_sub(waited)));
    }
}

/// Block until nothing is pending or leased in `queue`
///
/// Markers alone do not close a phase: duplicates of its tasks still in the
/// queue could rewrite outputs the next phase is reading. `prefix` only
/// labels the phase in logs and errors; `on_poll` runs before every check.
///
/// # Errors
///
/// Returns [`AlignError::QueueNotDrained`] when tasks remain after
/// `config.timeout`, or the first error from the queue or `on_poll`
pub fn wait_for_drain(
    queue: &dyn TaskQueue,
    prefix: &str,
    config: &BarrierConfig,
    mut on_poll: impl FnMut() -> Result<()>,
) -> Result<()> {
    let started = Instant::now();
    loop {
        on_poll()?;
        if queue.is_drained()? {
            debug!(prefix, "queue drained");
            return Ok(());
        }
        let waited = started.elapsed();
        if waited >= config.timeout {
            let outstanding = queue.outstanding()?;
            warn!(prefix, outstanding, "queue did not drain");
            return Err(AlignError::QueueNotDrained {
                prefix: prefix.to_string(),
                outstanding,
                waited,
            });
        }
        std::thread::sleep(config.poll_interval.min(config.timeout.saturating_sub(waited)));
    }
}
