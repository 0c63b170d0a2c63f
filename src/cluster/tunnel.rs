//! Local TCP listeners bridged to a pod through the API server's
//! port-forward subresource.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use k8s_openapi::{
    api::core::v1::{Pod, Service},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{Api, api::ListParams};
use snafu::ResultExt;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    task::AbortHandle,
    time::{sleep, timeout},
};

use super::{ApiSnafu, Error, label_selector};
use crate::{
    cache::Releasable,
    endpoint::ResourceId,
    internal_events::{TunnelClosed, TunnelConnectionFailed, TunnelOpened},
};

/// An open forwarding session. The listener task stops when the tunnel is
/// released or dropped.
#[derive(Debug)]
pub struct Tunnel {
    resource: ResourceId,
    local_addr: SocketAddr,
    task: Option<AbortHandle>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Wraps a forwarding session served by `task`, or by nothing owned by
    /// this process when `task` is `None`.
    pub fn new(resource: ResourceId, local_addr: SocketAddr, task: Option<AbortHandle>) -> Self {
        emit!(TunnelOpened {
            resource: &resource,
            local_addr
        });
        Self {
            resource,
            local_addr,
            task,
            closed: AtomicBool::new(false),
        }
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = &self.task {
            task.abort();
        }
        portpicker::release_port(self.local_addr.port());
        emit!(TunnelClosed {
            resource: &self.resource,
            local_addr: self.local_addr
        });
    }
}

impl Releasable for Tunnel {
    fn release(&self) {
        self.close();
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// First pause after a failed `accept`; doubles while failures repeat.
const ACCEPT_RETRY_INITIAL: Duration = Duration::from_millis(10);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

/// How long a probed stream must stay open to count as accepted.
const PROBE_SETTLE: Duration = Duration::from_millis(250);

/// Binds `127.0.0.1:local_port` and forwards every accepted connection to
/// `remote_port` on a ready pod selected by the service.
pub(super) async fn open(
    pods: Api<Pod>,
    service: &Service,
    resource: ResourceId,
    remote_port: u16,
    local_port: u16,
) -> Result<Tunnel, Error> {
    let (selector, target) = route(service, &resource, remote_port)?;

    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(|source| Error::TunnelBind {
            port: local_port,
            source,
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| Error::TunnelBind {
            port: local_port,
            source,
        })?;

    let accept_resource = resource.clone();
    let task = tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(error) => {
                    emit!(TunnelConnectionFailed {
                        resource: &accept_resource,
                        error: &error
                    });
                    failures = failures.saturating_add(1);
                    sleep(accept_backoff(failures)).await;
                    continue;
                }
            };
            trace!(message = "Accepted tunnel connection.", %peer, resource = %accept_resource);
            let pods = pods.clone();
            let selector = selector.clone();
            let target = target.clone();
            let resource = accept_resource.clone();
            tokio::spawn(async move {
                if let Err(error) = forward(pods, &resource, &selector, &target, conn).await {
                    emit!(TunnelConnectionFailed {
                        resource: &resource,
                        error: error.as_ref()
                    });
                }
            });
        }
    });

    Ok(Tunnel::new(resource, local_addr, Some(task.abort_handle())))
}

/// Pause before accepting again after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    ACCEPT_RETRY_INITIAL.saturating_mul(factor).min(ACCEPT_RETRY_MAX)
}

/// Opens a single forwarding stream to a ready pod and waits for the
/// kubelet to report whether it could connect to the container port.
pub(super) async fn probe(
    pods: Api<Pod>,
    service: &Service,
    resource: &ResourceId,
    remote_port: u16,
) -> Result<(), Error> {
    let (selector, target) = route(service, resource, remote_port)?;
    let (name, port) = select_pod(&pods, resource, &selector, &target).await?;
    let forward_error = |message: String| Error::PortForward {
        resource: resource.clone(),
        message,
    };

    let mut forwarder = pods.portforward(&name, &[port]).await.context(ApiSnafu {
        operation: "port forward",
    })?;
    let mut stream = forwarder
        .take_stream(port)
        .ok_or_else(|| forward_error("port-forward stream is unavailable".into()))?;
    let reported = forwarder.take_error(port);

    // A refused connection closes the stream right away. A listening server
    // either stays silent or greets.
    let mut greeting = [0u8; 1];
    let closed = matches!(
        timeout(PROBE_SETTLE, stream.read(&mut greeting)).await,
        Ok(Ok(0) | Err(_))
    );
    drop(stream);

    let reported = match reported {
        Some(error) => error.await,
        None => None,
    };
    forwarder
        .join()
        .await
        .map_err(|error| forward_error(error.to_string()))?;
    match reported {
        Some(message) => Err(forward_error(message)),
        None if closed => Err(forward_error(format!(
            "pod port {} closed the connection",
            port
        ))),
        None => Ok(()),
    }
}

/// The pod label selector and pod-side port behind service port `port`.
fn route(
    service: &Service,
    resource: &ResourceId,
    port: u16,
) -> Result<(String, IntOrString), Error> {
    let selector = service
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .filter(|selector| !selector.is_empty())
        .map(label_selector)
        .ok_or_else(|| Error::MissingSelector {
            resource: resource.clone(),
        })?;
    let target = target_port(service, port).ok_or_else(|| Error::UnknownServicePort {
        resource: resource.clone(),
        port,
    })?;
    Ok((selector, target))
}

/// Name and container port of the first ready pod matching `selector`.
async fn select_pod(
    pods: &Api<Pod>,
    resource: &ResourceId,
    selector: &str,
    target: &IntOrString,
) -> Result<(String, u16), Error> {
    let pod = pods
        .list(&ListParams::default().labels(selector))
        .await
        .context(ApiSnafu {
            operation: "list pods",
        })?
        .items
        .into_iter()
        .find(is_ready)
        .ok_or_else(|| Error::NoReadyPod {
            resource: resource.clone(),
        })?;
    let port = container_port(&pod, target).ok_or_else(|| Error::PortForward {
        resource: resource.clone(),
        message: "service target port is not declared by the pod".into(),
    })?;
    Ok((pod.metadata.name.unwrap_or_default(), port))
}

async fn forward(
    pods: Api<Pod>,
    resource: &ResourceId,
    selector: &str,
    target: &IntOrString,
    mut conn: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (name, port) = select_pod(&pods, resource, selector, target).await?;
    let mut forwarder = pods.portforward(&name, &[port]).await?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or("port-forward stream is unavailable")?;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    drop(upstream);
    forwarder.join().await?;
    Ok(())
}

/// The pod-side port a service port maps to.
fn target_port(service: &Service, port: u16) -> Option<IntOrString> {
    let entry = service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.port == i32::from(port))?;
    Some(
        entry
            .target_port
            .clone()
            .unwrap_or(IntOrString::Int(entry.port)),
    )
}

fn container_port(pod: &Pod, target: &IntOrString) -> Option<u16> {
    match target {
        IntOrString::Int(port) => u16::try_from(*port).ok(),
        IntOrString::String(name) => pod
            .spec
            .as_ref()?
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .and_then(|p| u16::try_from(p.container_port).ok()),
    }
}

pub(super) fn is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == "Ready" && c.status == "True")
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, PodCondition, PodSpec, PodStatus, ServicePort, ServiceSpec,
    };

    use super::*;

    fn service() -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort {
                        port: 5432,
                        target_port: Some(IntOrString::String("primary".into())),
                        ..Default::default()
                    },
                    ServicePort {
                        port: 9187,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(phase: &str, ready: &str) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "postgres".into(),
                    ports: Some(vec![ContainerPort {
                        name: Some("primary".into()),
                        container_port: 5432,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.into()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: ready.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_named_target_port() {
        let target = target_port(&service(), 5432).unwrap();
        assert_eq!(container_port(&pod("Running", "True"), &target), Some(5432));
    }

    #[test]
    fn defaults_target_port_to_service_port() {
        assert_eq!(target_port(&service(), 9187), Some(IntOrString::Int(9187)));
        assert_eq!(target_port(&service(), 80), None);
    }

    #[test]
    fn route_requires_selector_and_declared_port() {
        let id = ResourceId::new("ns", "pg");
        let mut service = service();
        assert!(matches!(
            route(&service, &id, 5432),
            Err(Error::MissingSelector { .. })
        ));

        if let Some(spec) = service.spec.as_mut() {
            spec.selector = Some([("app".to_owned(), "pg".to_owned())].into());
        }
        let (selector, target) = route(&service, &id, 5432).unwrap();
        assert_eq!(selector, "app=pg");
        assert_eq!(target, IntOrString::String("primary".into()));
        assert!(matches!(
            route(&service, &id, 80),
            Err(Error::UnknownServicePort { port: 80, .. })
        ));
    }

    #[test]
    fn accept_errors_back_off() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(5), Duration::from_millis(160));
        assert_eq!(accept_backoff(12), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn readiness_requires_running_and_ready() {
        assert!(is_ready(&pod("Running", "True")));
        assert!(!is_ready(&pod("Running", "False")));
        assert!(!is_ready(&pod("Pending", "True")));
        assert!(!is_ready(&Pod::default()));
    }

    #[tokio::test]
    async fn release_stops_the_task_once() {
        let task = tokio::spawn(std::future::pending::<()>());
        let tunnel = Tunnel::new(
            ResourceId::new("ns", "pg"),
            "127.0.0.1:15432".parse().unwrap(),
            Some(task.abort_handle()),
        );
        assert!(!tunnel.is_closed());
        tunnel.release();
        tunnel.release();
        assert!(tunnel.is_closed());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
