//! Errors surfaced by the lifecycle and access layers.

use std::{fmt, time::Duration};

use snafu::Snafu;

use crate::{access::AccessFailure, cluster, endpoint::ResourceId};

/// The step of `start` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    CreateNetworkResource,
    CreateWorkload,
    WaitReady,
    ResolveAccess,
}

impl StartupStep {
    pub const fn as_str(self) -> &'static str {
        match self {
            StartupStep::CreateNetworkResource => "create network resource",
            StartupStep::CreateWorkload => "create workload",
            StartupStep::WaitReady => "wait for readiness",
            StartupStep::ResolveAccess => "resolve external access",
        }
    }
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Cannot {} {}: resource is {}.", operation, resource, state))]
    State {
        resource: ResourceId,
        operation: &'static str,
        state: String,
    },

    #[snafu(display("{} {} does not exist.", kind, resource))]
    ResourceNotFound {
        resource: ResourceId,
        kind: &'static str,
    },

    #[snafu(display("Port {} of {} is not exposed: {}.", port, resource, reason))]
    PortNotExposed {
        resource: ResourceId,
        port: u16,
        reason: String,
    },

    #[snafu(display(
        "Timed out after {:?} waiting for {} ({}); last observed: {}.",
        elapsed,
        resource,
        condition,
        last_observed
    ))]
    Timeout {
        resource: ResourceId,
        condition: String,
        elapsed: Duration,
        last_observed: String,
    },

    #[snafu(display("Unable to reach port {} of {}: {}", port, resource, source))]
    Access {
        resource: ResourceId,
        port: u16,
        source: AccessFailure,
    },

    #[snafu(display("Failed to start '{}' at step '{}': {}", resource, step, source))]
    Startup {
        resource: ResourceId,
        step: StartupStep,
        rollback_failures: usize,
        source: Box<Error>,
    },

    #[snafu(display("{}", source))]
    Cluster { source: cluster::Error },
}

impl From<cluster::Error> for Error {
    fn from(source: cluster::Error) -> Self {
        Error::Cluster { source }
    }
}

impl Error {
    /// The error `start` wrapped, or `self` for every other variant.
    pub fn root(&self) -> &Error {
        match self {
            Error::Startup { source, .. } => source.root(),
            other => other,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
