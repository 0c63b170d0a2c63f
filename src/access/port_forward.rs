use std::net::{IpAddr, Ipv4Addr};

use snafu::ResultExt;

use super::{AccessFailure, TunnelSnafu, access_error};
use crate::{
    Error,
    cache::{CacheEntry, EndpointCache},
    cluster::{ClusterHandle, Tunnel},
    endpoint::{ExternalEndpoint, ResourceId},
};

/// Forwards a free local port to the service, keeping at most one tunnel
/// open per (resource, port).
#[derive(Default)]
pub struct PortForward {
    cache: EndpointCache<Tunnel>,
}

impl PortForward {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn cache(&self) -> &EndpointCache<Tunnel> {
        &self.cache
    }

    pub async fn resolve(
        &self,
        cluster: &dyn ClusterHandle,
        resource: &ResourceId,
        port: u16,
    ) -> Result<ExternalEndpoint, Error> {
        let key = resource.key(port);
        self.cache
            .get_or_try_insert_with(&key, || async {
                let local_port = portpicker::pick_unused_port(IpAddr::V4(Ipv4Addr::LOCALHOST))
                    .ok_or_else(|| access_error(resource, port, AccessFailure::NoFreePort))?;
                let tunnel = cluster
                    .port_forward(resource, port, local_port)
                    .await
                    .context(TunnelSnafu)
                    .map_err(|source| {
                        portpicker::release_port(local_port);
                        access_error(resource, port, source)
                    })?;
                let endpoint = ExternalEndpoint::localhost(tunnel.local_addr().port());
                Ok::<_, Error>(CacheEntry::new(endpoint, Some(tunnel)))
            })
            .await
    }

    pub fn cleanup(&self, resource: &ResourceId) {
        let closed = self.cache.invalidate_resource(resource);
        if closed > 0 {
            debug!(message = "Closed port-forward tunnels.", resource = %resource, count = closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{access::AccessStrategy, test_util::FakeCluster};

    fn id() -> ResourceId {
        ResourceId::new("ns", "postgres")
    }

    #[tokio::test]
    async fn repeated_resolution_reuses_the_tunnel() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let strategy = PortForward::new();

        let first = strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        let second = strategy.resolve(&cluster, &id(), 5432).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.host(), "127.0.0.1");
        assert_eq!(cluster.port_forward_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_tunnel() {
        let cluster = Arc::new(FakeCluster::new(AccessStrategy::port_forward()));
        cluster.set_port_forward_delay(Duration::from_millis(50));
        let strategy = Arc::new(PortForward::new());

        let tasks = (0..8).map(|_| {
            let cluster = Arc::clone(&cluster);
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move { strategy.resolve(cluster.as_ref(), &id(), 5432).await })
        });
        let endpoints: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|task| task.unwrap().unwrap())
            .collect();

        assert!(endpoints.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(cluster.port_forward_calls(), 1);
    }

    #[tokio::test]
    async fn cleanup_closes_tunnels_of_the_resource_only() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let strategy = PortForward::new();
        let other = ResourceId::new("ns", "postgres-replica");

        strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        strategy.resolve(&cluster, &id(), 9187).await.unwrap();
        strategy.resolve(&cluster, &other, 5432).await.unwrap();

        strategy.cleanup(&id());
        assert!(!strategy.cache().contains(&id().key(5432)));
        assert!(!strategy.cache().contains(&id().key(9187)));
        assert!(strategy.cache().contains(&other.key(5432)));

        strategy.resolve(&cluster, &id(), 5432).await.unwrap();
        assert_eq!(cluster.port_forward_calls(), 4);
    }

    #[tokio::test]
    async fn tunnel_failure_is_an_access_error() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        cluster.fail_on("port forward");
        let strategy = PortForward::new();

        let error = strategy.resolve(&cluster, &id(), 5432).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Access {
                port: 5432,
                source: AccessFailure::Tunnel { .. },
                ..
            }
        ));
        assert!(strategy.cache().is_empty());
    }
}
