//! The cluster seam: everything the lifecycle and access layers need from a
//! Kubernetes API server, behind one object-safe trait.

mod client;
mod tunnel;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::Service,
};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub use self::client::KubeCluster;
pub use self::tunnel::Tunnel;
use crate::{access::AccessStrategy, endpoint::ResourceId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Kubernetes API call {} failed: {}", operation, source))]
    Api {
        operation: &'static str,
        source: kube::Error,
    },
    #[snafu(display("Unable to load Kubernetes client configuration: {}", source))]
    Connect { source: kube::Error },
    #[snafu(display("Service {} does not exist.", resource))]
    ServiceNotFound { resource: ResourceId },
    #[snafu(display("No running and ready pod backs {}.", resource))]
    NoReadyPod { resource: ResourceId },
    #[snafu(display("{} has no label selector.", resource))]
    MissingSelector { resource: ResourceId },
    #[snafu(display("Service {} has no port {}.", resource, port))]
    UnknownServicePort { resource: ResourceId, port: u16 },
    #[snafu(display("Unable to bind local tunnel port {}: {}", port, source))]
    TunnelBind { port: u16, source: std::io::Error },
    #[snafu(display("Port-forward to {} failed: {}", resource, message))]
    PortForward { resource: ResourceId, message: String },
    #[snafu(display("Exec in {} failed: {}", resource, message))]
    Exec { resource: ResourceId, message: String },
}

impl Error {
    /// True when the API server reported the object as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { source: kube::Error::Api(response), .. } if response.code == 404)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    #[default]
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
        }
    }
}

/// The object that runs the containers of a managed resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
}

impl Workload {
    pub const fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
        }
    }

    pub fn id(&self) -> ResourceId {
        let metadata = match self {
            Workload::Deployment(d) => &d.metadata,
            Workload::StatefulSet(s) => &s.metadata,
        };
        ResourceId::new(
            metadata.namespace.clone().unwrap_or_default(),
            metadata.name.clone().unwrap_or_default(),
        )
    }

    /// Replicas currently reported by the controller.
    pub fn replicas(&self) -> i32 {
        match self {
            Workload::Deployment(d) => d.status.as_ref().and_then(|s| s.replicas),
            Workload::StatefulSet(s) => s.status.as_ref().map(|s| s.replicas),
        }
        .unwrap_or(0)
    }

    pub fn ready_replicas(&self) -> i32 {
        match self {
            Workload::Deployment(d) => d.status.as_ref().and_then(|s| s.ready_replicas),
            Workload::StatefulSet(s) => s.status.as_ref().and_then(|s| s.ready_replicas),
        }
        .unwrap_or(0)
    }

    /// Replicas requested in the spec; the API server defaults an unset
    /// value to one.
    pub fn desired_replicas(&self) -> i32 {
        match self {
            Workload::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
            Workload::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
        }
        .unwrap_or(1)
    }

    pub fn selector(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Workload::Deployment(d) => d.spec.as_ref()?.selector.match_labels.as_ref(),
            Workload::StatefulSet(s) => s.spec.as_ref()?.selector.match_labels.as_ref(),
        }
    }

    pub fn set_replicas(&mut self, replicas: i32, ready: i32) {
        match self {
            Workload::Deployment(d) => {
                let status = d.status.get_or_insert_with(Default::default);
                status.replicas = Some(replicas);
                status.ready_replicas = Some(ready);
            }
            Workload::StatefulSet(s) => {
                let status = s.status.get_or_insert_with(Default::default);
                status.replicas = replicas;
                status.ready_replicas = Some(ready);
            }
        }
    }
}

/// Outcome of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The service a tunnel or port check goes through.
pub fn require_service(service: Option<Service>, id: &ResourceId) -> Result<Service, Error> {
    service.ok_or_else(|| Error::ServiceNotFound {
        resource: id.clone(),
    })
}

/// Renders a label map the way `kubectl -l` expects it.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// A resolved connection to a cluster.
///
/// Missing objects are reported as `Ok(None)` from the getters and as
/// `Ok(false)` from the deletes, never as errors.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    async fn get_service(&self, id: &ResourceId) -> Result<Option<Service>, Error>;

    async fn create_service(&self, service: &Service) -> Result<(), Error>;

    async fn delete_service(&self, id: &ResourceId) -> Result<bool, Error>;

    async fn get_workload(
        &self,
        id: &ResourceId,
        kind: WorkloadKind,
    ) -> Result<Option<Workload>, Error>;

    async fn create_workload(&self, workload: &Workload) -> Result<(), Error>;

    async fn delete_workload(&self, id: &ResourceId, kind: WorkloadKind) -> Result<bool, Error>;

    /// Internal addresses of the cluster nodes, in listing order.
    async fn list_node_addresses(&self) -> Result<Vec<String>, Error>;

    /// Creates the namespace unless it already exists. Returns whether it
    /// was created by this call.
    async fn ensure_namespace(&self, name: &str) -> Result<bool, Error>;

    async fn delete_namespace(&self, name: &str) -> Result<bool, Error>;

    /// Opens a tunnel from `127.0.0.1:local_port` to `remote_port` of the
    /// service `id`.
    async fn port_forward(
        &self,
        id: &ResourceId,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Tunnel, Error>;

    /// Opens one forwarding stream to `remote_port` on a ready pod behind the
    /// service `id`. Succeeds only if that pod accepted the connection.
    async fn probe_port(&self, id: &ResourceId, remote_port: u16) -> Result<(), Error>;

    /// Current log output of the first pod of the workload.
    async fn logs(&self, id: &ResourceId, kind: WorkloadKind) -> Result<String, Error>;

    async fn exec(
        &self,
        id: &ResourceId,
        kind: WorkloadKind,
        command: &[String],
    ) -> Result<ExecResult, Error>;

    fn access_strategy(&self) -> &AccessStrategy;
}
