use std::{sync::OnceLock, time::Duration};

use k8s_openapi::api::core::v1::Service;
use tokio::time::Instant;

use super::node_port::fetch_service;
use crate::{
    Error,
    cluster::ClusterHandle,
    endpoint::{ExternalEndpoint, ResourceId},
    wait::{PollInterval, Probe, poll_until},
};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(120);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Waits for the cloud provider (or MetalLB and friends) to assign an
/// external address to the service.
pub struct LoadBalancer {
    max_wait: Duration,
    interval: Duration,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAIT, DEFAULT_INTERVAL)
    }
}

impl LoadBalancer {
    pub const fn new(max_wait: Duration, interval: Duration) -> Self {
        Self { max_wait, interval }
    }

    pub async fn resolve(
        &self,
        cluster: &dyn ClusterHandle,
        resource: &ResourceId,
        port: u16,
    ) -> Result<ExternalEndpoint, Error> {
        let deadline = Instant::now() + self.max_wait;
        let found = OnceLock::new();
        poll_until(
            resource,
            "load balancer address",
            deadline,
            PollInterval::Fixed(self.interval),
            || {
                let found = &found;
                async move {
                    let service = match fetch_service(cluster, resource).await {
                        Ok(service) => service,
                        Err(error @ Error::ResourceNotFound { .. }) => return Probe::Fatal(error),
                        Err(error) => return Probe::Pending(error.to_string()),
                    };
                    match assigned(&service, port) {
                        Ok(assigned) => {
                            let observed = format!("assigned {}", assigned);
                            let _ = found.set(assigned);
                            Probe::Ready(observed)
                        }
                        Err(observed) => Probe::Pending(observed),
                    }
                }
            },
        )
        .await?;
        found.into_inner().ok_or_else(|| Error::Timeout {
            resource: resource.clone(),
            condition: "load balancer address".into(),
            elapsed: self.max_wait,
            last_observed: "no address recorded".into(),
        })
    }
}

/// The first ingress address paired with the declared service port.
fn assigned(service: &Service, port: u16) -> Result<ExternalEndpoint, String> {
    let ingress = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .ok_or_else(|| String::from("no ingress assigned"))?;
    let host = ingress
        .ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
        .or_else(|| ingress.hostname.as_deref().filter(|h| !h.is_empty()))
        .ok_or_else(|| String::from("ingress has neither ip nor hostname"))?;
    let declared = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .is_some_and(|ports| ports.iter().any(|p| p.port == i32::from(port)));
    if !declared {
        return Err(format!("ingress {} does not list port {}", host, port));
    }
    Ok(ExternalEndpoint::new(host, port))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        access::AccessStrategy,
        test_util::{FakeCluster, load_balancer_service},
    };

    fn id() -> ResourceId {
        ResourceId::new("ns", "kafka")
    }

    fn strategy() -> LoadBalancer {
        LoadBalancer::new(Duration::from_secs(120), Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_ingress_ip() {
        let cluster = Arc::new(FakeCluster::new(AccessStrategy::load_balancer(
            DEFAULT_MAX_WAIT,
            DEFAULT_INTERVAL,
        )));
        cluster.insert_service(load_balancer_service(&id(), 9092, None, None));

        let assign = {
            let cluster = Arc::clone(&cluster);
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cluster.insert_service(load_balancer_service(
                    &id(),
                    9092,
                    Some("203.0.113.10"),
                    None,
                ));
            }
        };
        let strategy = strategy();
        let resource = id();
        let started = Instant::now();
        let (endpoint, ()) = tokio::join!(
            strategy.resolve(cluster.as_ref(), &resource, 9092),
            assign
        );

        assert_eq!(endpoint.unwrap(), ExternalEndpoint::new("203.0.113.10", 9092));
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_hostname() {
        let cluster = FakeCluster::new(AccessStrategy::load_balancer(
            DEFAULT_MAX_WAIT,
            DEFAULT_INTERVAL,
        ));
        cluster.insert_service(load_balancer_service(
            &id(),
            9092,
            Some(""),
            Some("lb.example.com"),
        ));
        let endpoint = strategy().resolve(&cluster, &id(), 9092).await.unwrap();
        assert_eq!(endpoint, ExternalEndpoint::new("lb.example.com", 9092));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_address() {
        let cluster = FakeCluster::new(AccessStrategy::load_balancer(
            DEFAULT_MAX_WAIT,
            DEFAULT_INTERVAL,
        ));
        cluster.insert_service(load_balancer_service(&id(), 9092, None, None));

        let started = Instant::now();
        let error = strategy().resolve(&cluster, &id(), 9092).await.unwrap_err();
        assert!(error.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_service_fails_immediately() {
        let cluster = FakeCluster::new(AccessStrategy::load_balancer(
            DEFAULT_MAX_WAIT,
            DEFAULT_INTERVAL,
        ));
        let error = strategy().resolve(&cluster, &id(), 9092).await.unwrap_err();
        assert!(matches!(error, Error::ResourceNotFound { .. }));
    }

    #[test]
    fn undeclared_port_keeps_waiting() {
        let service = load_balancer_service(&id(), 9092, Some("203.0.113.10"), None);
        assert_eq!(
            assigned(&service, 9093).unwrap_err(),
            "ingress 203.0.113.10 does not list port 9093"
        );
    }
}
