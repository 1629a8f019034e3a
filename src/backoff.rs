//! Reconnect scheduling for the notification hub.
//!
//! The schedule is a fixed step ladder rather than a multiplicative policy:
//! the first retry is immediate, later retries stretch to a capped ceiling.

use std::time::Duration;

use tokio::sync::watch;

/// Delays before consecutive reconnect attempts, indexed from attempt 1.
/// Attempts past the ladder reuse the final (capped) entry.
const RETRY_DELAYS: [Duration; 5] = [
    Duration::ZERO,
    Duration::from_millis(2_000),
    Duration::from_millis(10_000),
    Duration::from_millis(30_000),
    Duration::from_millis(60_000),
];

/// Policy controlling hub reconnection behavior.
#[derive(Clone, Debug)]
pub struct ReconnectSchedule {
    /// Consecutive attempts before pausing for a full reinitialization.
    pub max_attempts: usize,
    /// Pause before starting a fresh attempt cycle once `max_attempts` is
    /// exhausted.
    pub reinit_delay: Duration,
}

impl ReconnectSchedule {
    /// Computes the delay to apply before the given attempt.
    ///
    /// `attempt` is 1-based; attempt 1 is immediate.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let index = attempt.saturating_sub(1).min(RETRY_DELAYS.len() - 1);
        RETRY_DELAYS[index]
    }
}

impl Default for ReconnectSchedule {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            reinit_delay: Duration::from_secs(5),
        }
    }
}

/// Sleeps for `delay` unless the cancel flag flips to `true` first.
///
/// Returns `false` when cancelled (including a dropped sender), so a manual
/// disconnect can never race a pending timer into a phantom reconnect.
pub(crate) async fn sleep_unless_cancelled(
    delay: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    if *cancel.borrow() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = cancel.changed() => match changed {
                Ok(()) if *cancel.borrow() => return false,
                Ok(()) => {}
                Err(_) => return false,
            },
        }
    }
}
