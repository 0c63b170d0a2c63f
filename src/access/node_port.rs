use k8s_openapi::api::core::v1::Service;
use tokio::sync::OnceCell;

use crate::{
    Error,
    cluster::ClusterHandle,
    endpoint::{ExternalEndpoint, LOOPBACK_HOST, ResourceId},
    internal_events::NodeAddressFallback,
};

/// Reaches services through a node address and the allocated node port.
#[derive(Default)]
pub struct NodePort {
    node_address: Option<String>,
    detected: OnceCell<String>,
}

impl NodePort {
    pub fn new(node_address: Option<String>) -> Self {
        Self {
            node_address: node_address.filter(|address| !address.is_empty()),
            detected: OnceCell::new(),
        }
    }

    pub async fn resolve(
        &self,
        cluster: &dyn ClusterHandle,
        resource: &ResourceId,
        port: u16,
    ) -> Result<ExternalEndpoint, Error> {
        let service = fetch_service(cluster, resource).await?;
        let node_port = node_port(&service, resource, port)?;
        let host = self.node_address(cluster).await?;
        Ok(ExternalEndpoint::new(host, node_port))
    }

    /// The configured override, else the first node's internal address,
    /// else loopback. A detected address is kept for the strategy's lifetime;
    /// the loopback fallback is not, so nodes are listed again next time.
    async fn node_address(&self, cluster: &dyn ClusterHandle) -> Result<String, Error> {
        if let Some(address) = &self.node_address {
            return Ok(address.clone());
        }
        if let Some(detected) = self.detected.get() {
            return Ok(detected.clone());
        }
        match cluster.list_node_addresses().await?.into_iter().next() {
            Some(address) => Ok(self.detected.get_or_init(|| async { address }).await.clone()),
            None => {
                emit!(NodeAddressFallback {
                    address: LOOPBACK_HOST
                });
                Ok(LOOPBACK_HOST.to_owned())
            }
        }
    }
}

pub(super) async fn fetch_service(
    cluster: &dyn ClusterHandle,
    resource: &ResourceId,
) -> Result<Service, Error> {
    cluster
        .get_service(resource)
        .await?
        .ok_or_else(|| Error::ResourceNotFound {
            resource: resource.clone(),
            kind: "service",
        })
}

/// The node port allocated for service port `port`.
pub(super) fn node_port(service: &Service, resource: &ResourceId, port: u16) -> Result<u16, Error> {
    let not_exposed = |reason: &str| Error::PortNotExposed {
        resource: resource.clone(),
        port,
        reason: reason.to_owned(),
    };
    let entry = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == i32::from(port)))
        .ok_or_else(|| not_exposed("the service does not declare this port"))?;
    entry
        .node_port
        .and_then(|node_port| u16::try_from(node_port).ok())
        .filter(|node_port| *node_port != 0)
        .ok_or_else(|| not_exposed("no node port is allocated; is the service of type NodePort?"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::AccessStrategy,
        test_util::{FakeCluster, node_port_service},
    };

    fn id() -> ResourceId {
        ResourceId::new("ns", "postgres")
    }

    fn cluster() -> FakeCluster {
        let cluster = FakeCluster::new(AccessStrategy::node_port(None));
        cluster.insert_service(node_port_service(&id(), &[(5432, 31000)]));
        cluster
    }

    #[tokio::test]
    async fn resolves_allocated_node_port() {
        let cluster = cluster();
        cluster.set_node_addresses(&["10.0.0.7", "10.0.0.8"]);

        let endpoint = NodePort::new(None).resolve(&cluster, &id(), 5432).await.unwrap();
        assert_eq!(endpoint, ExternalEndpoint::new("10.0.0.7", 31000));
    }

    #[tokio::test]
    async fn undeclared_port_is_not_exposed() {
        let error = NodePort::new(None)
            .resolve(&cluster(), &id(), 9999)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::PortNotExposed { port: 9999, .. }));
    }

    #[tokio::test]
    async fn missing_service_is_not_found() {
        let cluster = FakeCluster::new(AccessStrategy::node_port(None));
        let error = NodePort::new(None)
            .resolve(&cluster, &id(), 5432)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::ResourceNotFound { kind: "service", .. }));
    }

    #[tokio::test]
    async fn override_and_loopback_fallback() {
        let cluster = cluster();
        let overridden = NodePort::new(Some("192.168.49.2".into()))
            .resolve(&cluster, &id(), 5432)
            .await
            .unwrap();
        assert_eq!(overridden.host(), "192.168.49.2");

        let fallback = NodePort::new(None).resolve(&cluster, &id(), 5432).await.unwrap();
        assert_eq!(fallback, ExternalEndpoint::new("127.0.0.1", 31000));
    }

    #[tokio::test]
    async fn detects_node_address_once() {
        let cluster = cluster();
        cluster.set_node_addresses(&["10.0.0.7"]);
        let strategy = NodePort::new(None);

        strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        cluster.set_node_addresses(&["10.0.0.9"]);
        let endpoint = strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        assert_eq!(endpoint.host(), "10.0.0.7");
    }

    #[tokio::test]
    async fn loopback_fallback_is_not_cached() {
        let cluster = cluster();
        let strategy = NodePort::new(None);

        let fallback = strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        assert_eq!(fallback.host(), "127.0.0.1");

        cluster.set_node_addresses(&["10.0.0.7"]);
        let detected = strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        assert_eq!(detected, ExternalEndpoint::new("10.0.0.7", 31000));
    }

    #[test]
    fn cluster_ip_service_has_no_node_port() {
        let mut service = node_port_service(&id(), &[(5432, 31000)]);
        if let Some(ports) = service.spec.as_mut().and_then(|spec| spec.ports.as_mut()) {
            ports[0].node_port = None;
        }
        let error = node_port(&service, &id(), 5432).unwrap_err();
        assert!(error.to_string().contains("no node port is allocated"));
    }
}
