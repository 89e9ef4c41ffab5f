//! Bounded, backoff-driven wait for an operation to finish

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::OperationStatus;
use crate::store::Store;
use crate::utils::{backoff_delay, BackoffOptions};

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub max_attempts: u32,
    pub backoff: BackoffOptions,
    /// Absolute budget across all attempts
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            backoff: BackoffOptions {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(15),
                multiplier: 1.5,
            },
            timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Failed,
    TimedOut,
}

impl PollOutcome {
    pub fn is_completed(self) -> bool {
        self == PollOutcome::Completed
    }
}

/// Delay before attempt `attempt + 1`, or `None` once attempts are exhausted
pub fn next_delay(options: &PollOptions, attempt: u32) -> Option<Duration> {
    if attempt + 1 >= options.max_attempts {
        return None;
    }
    Some(backoff_delay(&options.backoff, attempt))
}

/// Delay before re-checking after check number `attempt` (zero-based), cut
/// short at `deadline`. `None` once either budget is spent.
pub fn retry_after(options: &PollOptions, attempt: u32, deadline: Instant) -> Option<Duration> {
    let delay = next_delay(options, attempt)?;
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    Some(delay.min(deadline - now))
}

/// Terminal outcome of an operation, `None` while it is still queued or running.
/// A vanished record counts as failed.
pub fn check(store: &Store, id: &Uuid) -> Option<PollOutcome> {
    match store.operations.get(id).map(|op| op.status) {
        Some(OperationStatus::Completed) => Some(PollOutcome::Completed),
        Some(OperationStatus::Error) => Some(PollOutcome::Failed),
        Some(_) => None,
        None => {
            warn!(operation = %id, "Operation disappeared while being awaited");
            Some(PollOutcome::Failed)
        }
    }
}

/// Reload the operation until it is terminal, attempts run out, or the
/// absolute timeout passes
pub async fn await_terminal(store: &Store, id: Uuid, options: &PollOptions) -> PollOutcome {
    let deadline = Instant::now() + options.timeout;
    let mut attempt = 0;

    loop {
        if let Some(outcome) = check(store, &id) {
            debug!(operation = %id, attempt, "Operation finished: {:?}", outcome);
            return outcome;
        }

        let Some(delay) = retry_after(options, attempt, deadline) else {
            break;
        };
        tokio::time::sleep(delay).await;
        attempt += 1;
    }

    // one last look in case it finished during the final sleep
    if let Some(outcome) = check(store, &id) {
        return outcome;
    }
    warn!(
        operation = %id,
        attempts = attempt + 1,
        "Gave up waiting for operation after {:?}",
        options.timeout
    );
    PollOutcome::TimedOut
}
