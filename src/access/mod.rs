//! Turns an internal port of a managed resource into an address the test
//! process can connect to.

pub mod helper;
pub mod load_balancer;
mod node_port;
mod port_forward;

use std::time::Duration;

use snafu::Snafu;

pub use self::helper::{HelperProcess, HelperSession, parse_helper_url};
pub use self::load_balancer::LoadBalancer;
pub use self::node_port::NodePort;
pub use self::port_forward::PortForward;
use crate::{
    Error,
    cluster::{self, ClusterHandle},
    endpoint::{ExternalEndpoint, ResourceId},
    internal_events::EndpointResolved,
};

/// Causes wrapped by [`Error::Access`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AccessFailure {
    #[snafu(display("unable to open tunnel: {}", source))]
    Tunnel { source: cluster::Error },

    #[snafu(display("no free local port is available"))]
    NoFreePort,

    #[snafu(display("unable to run {:?}: {}", program, source))]
    HelperSpawn {
        program: String,
        source: std::io::Error,
    },

    #[snafu(display("unable to read helper output: {}", source))]
    HelperIo { source: std::io::Error },

    #[snafu(display("helper did not report an address within {:?}", timeout))]
    HelperTimeout { timeout: Duration },

    #[snafu(display(
        "helper exited with {} without printing a URL; output: {:?}",
        exit_code.map_or_else(|| "a signal".to_owned(), |code| format!("code {}", code)),
        output
    ))]
    HelperOutput {
        exit_code: Option<i32>,
        output: String,
    },

    #[snafu(display("{}; fallback failed: {}", primary, fallback))]
    HelperFallback {
        primary: Box<AccessFailure>,
        fallback: Box<Error>,
    },
}

/// How services are exposed to the test process.
pub enum AccessStrategy {
    /// Local tunnels through the API server, one per (resource, port).
    PortForward(PortForward),
    /// Node address plus the service's allocated node port.
    NodePort(NodePort),
    /// External address assigned to a `LoadBalancer` service.
    LoadBalancer(LoadBalancer),
    /// A helper command such as `minikube service --url`.
    HelperProcess(HelperProcess),
}

impl AccessStrategy {
    pub fn port_forward() -> Self {
        AccessStrategy::PortForward(PortForward::new())
    }

    pub fn node_port(node_address: Option<String>) -> Self {
        AccessStrategy::NodePort(NodePort::new(node_address))
    }

    pub fn load_balancer(max_wait: Duration, interval: Duration) -> Self {
        AccessStrategy::LoadBalancer(LoadBalancer::new(max_wait, interval))
    }

    /// `command` is the program followed by any leading arguments.
    pub fn helper_process(command: Vec<String>, profile: Option<String>, timeout: Duration) -> Self {
        AccessStrategy::HelperProcess(HelperProcess::new(command, profile, timeout))
    }

    pub const fn name(&self) -> &'static str {
        match self {
            AccessStrategy::PortForward(_) => "port_forward",
            AccessStrategy::NodePort(_) => "node_port",
            AccessStrategy::LoadBalancer(_) => "load_balancer",
            AccessStrategy::HelperProcess(_) => "helper_process",
        }
    }

    /// The service type the network resource must be created with for this
    /// strategy to work.
    pub const fn service_type(&self) -> &'static str {
        match self {
            AccessStrategy::PortForward(_) => "ClusterIP",
            AccessStrategy::NodePort(_) | AccessStrategy::HelperProcess(_) => "NodePort",
            AccessStrategy::LoadBalancer(_) => "LoadBalancer",
        }
    }

    /// Resolves `port` of `resource` to an external endpoint. Safe to call
    /// concurrently; cached variants resolve each (resource, port) once.
    pub async fn resolve(
        &self,
        cluster: &dyn ClusterHandle,
        resource: &ResourceId,
        port: u16,
    ) -> Result<ExternalEndpoint, Error> {
        let endpoint = match self {
            AccessStrategy::PortForward(strategy) => strategy.resolve(cluster, resource, port).await,
            AccessStrategy::NodePort(strategy) => strategy.resolve(cluster, resource, port).await,
            AccessStrategy::LoadBalancer(strategy) => {
                strategy.resolve(cluster, resource, port).await
            }
            AccessStrategy::HelperProcess(strategy) => {
                strategy.resolve(cluster, resource, port).await
            }
        }?;
        emit!(EndpointResolved {
            resource,
            port,
            strategy: self.name(),
            endpoint: &endpoint
        });
        Ok(endpoint)
    }

    /// Releases tunnels and helper sessions held for `resource`.
    pub fn cleanup(&self, resource: &ResourceId) {
        match self {
            AccessStrategy::PortForward(strategy) => strategy.cleanup(resource),
            AccessStrategy::HelperProcess(strategy) => strategy.cleanup(resource),
            AccessStrategy::NodePort(_) | AccessStrategy::LoadBalancer(_) => {}
        }
    }

    /// Forgets the resolution of one port, closing its tunnel or helper
    /// session, so the next `resolve` starts over. Returns whether anything
    /// was cached.
    pub fn invalidate(&self, resource: &ResourceId, port: u16) -> bool {
        let key = resource.key(port);
        match self {
            AccessStrategy::PortForward(strategy) => strategy.cache().invalidate(&key),
            AccessStrategy::HelperProcess(strategy) => strategy.cache().invalidate(&key),
            AccessStrategy::NodePort(_) | AccessStrategy::LoadBalancer(_) => false,
        }
    }

    /// Whether a resolution of `port` of `resource` is currently cached.
    pub fn cached(&self, resource: &ResourceId, port: u16) -> bool {
        let key = resource.key(port);
        match self {
            AccessStrategy::PortForward(strategy) => strategy.cache().contains(&key),
            AccessStrategy::HelperProcess(strategy) => strategy.cache().contains(&key),
            AccessStrategy::NodePort(_) | AccessStrategy::LoadBalancer(_) => false,
        }
    }
}

pub(crate) fn access_error(resource: &ResourceId, port: u16, source: AccessFailure) -> Error {
    Error::Access {
        resource: resource.clone(),
        port,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeCluster;

    fn id() -> ResourceId {
        ResourceId::new("ns", "postgres")
    }

    #[tokio::test]
    async fn invalidate_evicts_a_single_port() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let strategy = AccessStrategy::port_forward();

        strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        strategy.resolve(&cluster, &id(), 9187).await.unwrap();

        assert!(strategy.invalidate(&id(), 5432));
        assert!(!strategy.invalidate(&id(), 5432));
        assert!(!strategy.cached(&id(), 5432));
        assert!(strategy.cached(&id(), 9187));

        strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        assert!(strategy.cached(&id(), 5432));
        assert_eq!(cluster.port_forward_calls(), 3);
    }

    #[tokio::test]
    async fn invalidate_is_a_no_op_without_a_cache() {
        let strategy = AccessStrategy::node_port(Some("10.0.0.7".into()));
        assert!(!strategy.invalidate(&id(), 5432));
    }
}
