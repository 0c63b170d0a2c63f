use std::{error::Error, fmt::Debug, time::Duration};

use metrics::{counter, histogram};

use super::InternalEvent;
use crate::{
    endpoint::{ExternalEndpoint, ResourceId},
    error::StartupStep,
};

#[derive(Debug)]
pub struct ResourceStarting<'a> {
    pub resource: &'a ResourceId,
    pub strategy: &'static str,
}

impl InternalEvent for ResourceStarting<'_> {
    fn emit_logs(&self) {
        info!(
            message = "Starting resource.",
            resource = %self.resource,
            strategy = self.strategy,
        );
    }
}

#[derive(Debug)]
pub struct ResourceReady<'a> {
    pub resource: &'a ResourceId,
    pub endpoint: &'a ExternalEndpoint,
    pub elapsed: Duration,
}

impl InternalEvent for ResourceReady<'_> {
    fn emit_logs(&self) {
        info!(
            message = "Resource is ready.",
            resource = %self.resource,
            endpoint = %self.endpoint,
            elapsed = ?self.elapsed,
        );
    }

    fn emit_metrics(&self) {
        counter!("resources_started_total").increment(1);
        histogram!("resource_startup_seconds").record(self.elapsed.as_secs_f64());
    }
}

#[derive(Debug)]
pub struct ResourceStartFailed<'a> {
    pub resource: &'a ResourceId,
    pub step: StartupStep,
    pub error: &'a dyn Error,
    pub rollback_failures: usize,
}

impl InternalEvent for ResourceStartFailed<'_> {
    fn emit_logs(&self) {
        error!(
            message = "Resource failed to start.",
            resource = %self.resource,
            step = %self.step,
            error = %self.error,
            rollback_failures = self.rollback_failures,
        );
    }

    fn emit_metrics(&self) {
        counter!(
            "resource_start_failures_total",
            "step" => self.step.as_str(),
        )
        .increment(1);
    }
}

#[derive(Debug)]
pub struct ResourceCreated<'a> {
    pub resource: &'a ResourceId,
    pub kind: &'a str,
}

impl InternalEvent for ResourceCreated<'_> {
    fn emit_logs(&self) {
        debug!(
            message = "Created cluster object.",
            resource = %self.resource,
            kind = %self.kind,
        );
    }
}

#[derive(Debug)]
pub struct RollbackStepFailed<'a> {
    pub action: &'a dyn Debug,
    pub error: &'a dyn Error,
}

impl InternalEvent for RollbackStepFailed<'_> {
    fn emit_logs(&self) {
        warn!(
            message = "Rollback step failed; continuing.",
            action = ?self.action,
            error = %self.error,
        );
    }

    fn emit_metrics(&self) {
        counter!("rollback_failures_total").increment(1);
    }
}

#[derive(Debug)]
pub struct ResourceDeleted<'a> {
    pub resource: &'a ResourceId,
    pub kind: &'a str,
    pub existed: bool,
}

impl InternalEvent for ResourceDeleted<'_> {
    fn emit_logs(&self) {
        if self.existed {
            debug!(
                message = "Deleted cluster object.",
                resource = %self.resource,
                kind = %self.kind,
            );
        } else {
            trace!(
                message = "Cluster object was already gone.",
                resource = %self.resource,
                kind = %self.kind,
            );
        }
    }
}

#[derive(Debug)]
pub struct ResourceDeleteFailed<'a> {
    pub resource: &'a ResourceId,
    pub kind: &'a str,
    pub error: &'a dyn Error,
}

impl InternalEvent for ResourceDeleteFailed<'_> {
    fn emit_logs(&self) {
        warn!(
            message = "Failed to delete cluster object.",
            resource = %self.resource,
            kind = %self.kind,
            error = %self.error,
        );
    }

    fn emit_metrics(&self) {
        counter!("resource_delete_failures_total", "kind" => self.kind.to_owned()).increment(1);
    }
}

#[derive(Debug)]
pub struct ResourceStopped<'a> {
    pub resource: &'a ResourceId,
}

impl InternalEvent for ResourceStopped<'_> {
    fn emit_logs(&self) {
        info!(message = "Resource stopped.", resource = %self.resource);
    }

    fn emit_metrics(&self) {
        counter!("resources_stopped_total").increment(1);
    }
}
