use std::time::Duration;

use metrics::{counter, histogram};

use super::InternalEvent;
use crate::endpoint::ResourceId;

#[derive(Debug)]
pub struct WaitAttemptPending<'a> {
    pub resource: &'a ResourceId,
    pub condition: &'a str,
    pub attempt: u32,
    pub observed: &'a str,
}

impl InternalEvent for WaitAttemptPending<'_> {
    fn emit_logs(&self) {
        trace!(
            message = "Condition not met yet.",
            resource = %self.resource,
            condition = %self.condition,
            attempt = self.attempt,
            observed = %self.observed,
        );
    }

    fn emit_metrics(&self) {
        counter!("wait_attempts_total", "outcome" => "pending").increment(1);
    }
}

#[derive(Debug)]
pub struct WaitSucceeded<'a> {
    pub resource: &'a ResourceId,
    pub condition: &'a str,
    pub elapsed: Duration,
    pub attempts: u32,
}

impl InternalEvent for WaitSucceeded<'_> {
    fn emit_logs(&self) {
        debug!(
            message = "Condition met.",
            resource = %self.resource,
            condition = %self.condition,
            elapsed = ?self.elapsed,
            attempts = self.attempts,
        );
    }

    fn emit_metrics(&self) {
        counter!("wait_attempts_total", "outcome" => "ready").increment(1);
        histogram!("wait_duration_seconds").record(self.elapsed.as_secs_f64());
    }
}

#[derive(Debug)]
pub struct WaitTimedOut<'a> {
    pub resource: &'a ResourceId,
    pub condition: &'a str,
    pub elapsed: Duration,
    pub attempts: u32,
}

impl InternalEvent for WaitTimedOut<'_> {
    fn emit_logs(&self) {
        warn!(
            message = "Timed out waiting for condition.",
            resource = %self.resource,
            condition = %self.condition,
            elapsed = ?self.elapsed,
            attempts = self.attempts,
        );
    }

    fn emit_metrics(&self) {
        counter!("wait_timeouts_total").increment(1);
    }
}
