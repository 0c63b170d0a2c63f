//! Deadline-bounded polling shared by wait strategies and access strategies
//! that have to wait for the cluster to converge.

use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep, timeout_at};

use crate::{
    Error,
    endpoint::ResourceId,
    internal_events::{WaitAttemptPending, WaitSucceeded, WaitTimedOut},
};

/// Delay between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterval {
    Fixed(Duration),
    /// Doubles after every attempt, starting at `initial` and capped at `max`.
    Backoff { initial: Duration, max: Duration },
}

impl Default for PollInterval {
    fn default() -> Self {
        PollInterval::Fixed(Duration::from_millis(500))
    }
}

impl PollInterval {
    /// Delay after the given attempt, counting from one.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            PollInterval::Fixed(interval) => interval,
            PollInterval::Backoff { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Result of one attempt.
#[derive(Debug)]
pub enum Probe {
    /// The condition holds; carries what was observed.
    Ready(String),
    /// Not yet; carries what was observed for the eventual timeout message.
    Pending(String),
    /// Further polling cannot succeed.
    Fatal(Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub ready: bool,
    pub elapsed: Duration,
    pub attempts: u32,
    pub last_observed: String,
}

/// Calls `probe` until it reports ready, fails fatally, or `deadline` passes.
///
/// A timeout is only reported once the deadline has been reached. Each
/// attempt and each pause is cut short at the deadline, so the overshoot is
/// bounded by scheduling latency rather than by the interval.
pub async fn poll_until<F, Fut>(
    resource: &ResourceId,
    condition: &str,
    deadline: Instant,
    interval: PollInterval,
    mut probe: F,
) -> Result<WaitOutcome, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last_observed = String::from("no attempt completed");

    loop {
        let now = Instant::now();
        if now >= deadline {
            let elapsed = now.duration_since(started);
            emit!(WaitTimedOut {
                resource,
                condition,
                elapsed,
                attempts
            });
            return Err(Error::Timeout {
                resource: resource.clone(),
                condition: condition.to_owned(),
                elapsed,
                last_observed,
            });
        }

        attempts += 1;
        match timeout_at(deadline, probe()).await {
            Ok(Probe::Ready(observed)) => {
                let elapsed = started.elapsed();
                emit!(WaitSucceeded {
                    resource,
                    condition,
                    elapsed,
                    attempts
                });
                return Ok(WaitOutcome {
                    ready: true,
                    elapsed,
                    attempts,
                    last_observed: observed,
                });
            }
            Ok(Probe::Pending(observed)) => {
                emit!(WaitAttemptPending {
                    resource,
                    condition,
                    attempt: attempts,
                    observed: &observed
                });
                last_observed = observed;
            }
            Ok(Probe::Fatal(error)) => return Err(error),
            Err(_) => {
                last_observed = String::from("check still running at the deadline");
                continue;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            sleep(interval.delay(attempts).min(remaining)).await;
        }
    }
}
