//! An in-memory [`ClusterHandle`] for exercising the lifecycle and access
//! layers without a cluster.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStatus},
        core::v1::{
            LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort, ServiceSpec,
            ServiceStatus,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::core::ErrorResponse;

use crate::{
    access::AccessStrategy,
    cluster::{
        ClusterHandle, Error, ExecResult, Tunnel, Workload, WorkloadKind, require_service,
    },
    endpoint::ResourceId,
};

const FIRST_NODE_PORT: i32 = 30000;

/// Successful mutations, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateService(ResourceId),
    CreateWorkload(ResourceId),
    DeleteService(ResourceId),
    DeleteWorkload(ResourceId),
    CreateNamespace(String),
    DeleteNamespace(String),
}

struct State {
    services: BTreeMap<ResourceId, Service>,
    workloads: BTreeMap<(ResourceId, WorkloadKind), Workload>,
    namespaces: BTreeSet<String>,
    node_addresses: Vec<String>,
    logs: HashMap<ResourceId, String>,
    exec_results: HashMap<ResourceId, ExecResult>,
    exec_calls: Vec<Vec<String>>,
    failures: HashSet<&'static str>,
    operations: Vec<Operation>,
    auto_ready: bool,
    next_node_port: i32,
    port_forward_delay: Option<Duration>,
}

struct Inner {
    access: AccessStrategy,
    state: Mutex<State>,
    port_forward_calls: AtomicUsize,
}

/// Clones share state.
#[derive(Clone)]
pub struct FakeCluster {
    inner: Arc<Inner>,
}

impl FakeCluster {
    /// Workloads created through the handle report all replicas ready
    /// unless [`FakeCluster::set_auto_ready`] turns that off.
    pub fn new(access: AccessStrategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                access,
                state: Mutex::new(State {
                    services: BTreeMap::new(),
                    workloads: BTreeMap::new(),
                    namespaces: BTreeSet::new(),
                    node_addresses: Vec::new(),
                    logs: HashMap::new(),
                    exec_results: HashMap::new(),
                    exec_calls: Vec::new(),
                    failures: HashSet::new(),
                    operations: Vec::new(),
                    auto_ready: true,
                    next_node_port: FIRST_NODE_PORT,
                    port_forward_delay: None,
                }),
                port_forward_calls: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .expect("fake cluster state lock poisoned")
    }

    /// Makes every call named `operation` (e.g. `"create deployment"`)
    /// fail with a server error.
    pub fn fail_on(&self, operation: &'static str) {
        self.state().failures.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    fn check(&self, operation: &'static str) -> Result<(), Error> {
        if self.state().failures.contains(operation) {
            return Err(Error::Api {
                operation,
                source: kube::Error::Api(ErrorResponse {
                    status: "Failure".into(),
                    message: format!("injected failure for {}", operation),
                    reason: "InternalError".into(),
                    code: 500,
                }),
            });
        }
        Ok(())
    }

    pub fn set_auto_ready(&self, auto_ready: bool) {
        self.state().auto_ready = auto_ready;
    }

    pub fn set_node_addresses(&self, addresses: &[&str]) {
        self.state().node_addresses = addresses.iter().map(|a| (*a).to_owned()).collect();
    }

    pub fn set_logs(&self, id: &ResourceId, logs: &str) {
        self.state().logs.insert(id.clone(), logs.to_owned());
    }

    pub fn set_exec_result(&self, id: &ResourceId, result: ExecResult) {
        self.state().exec_results.insert(id.clone(), result);
    }

    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.state().exec_calls.clone()
    }

    pub fn set_port_forward_delay(&self, delay: Duration) {
        self.state().port_forward_delay = Some(delay);
    }

    pub fn port_forward_calls(&self) -> usize {
        self.inner.port_forward_calls.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    pub fn insert_service(&self, service: Service) {
        let id = object_id(&service.metadata);
        self.state().services.insert(id, service);
    }

    pub fn service(&self, id: &ResourceId) -> Option<Service> {
        self.state().services.get(id).cloned()
    }

    pub fn insert_workload(&self, workload: Workload) {
        let key = (workload.id(), workload.kind());
        self.state().workloads.insert(key, workload);
    }

    /// Sets ready replicas of the deployment `id`.
    pub fn set_ready(&self, id: &ResourceId, ready: i32) {
        if let Some(workload) = self
            .state()
            .workloads
            .get_mut(&(id.clone(), WorkloadKind::Deployment))
        {
            let desired = workload.desired_replicas();
            workload.set_replicas(desired, ready);
        }
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state().namespaces.contains(name)
    }
}

fn object_id(metadata: &ObjectMeta) -> ResourceId {
    ResourceId::new(
        metadata.namespace.clone().unwrap_or_else(|| "default".into()),
        metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl ClusterHandle for FakeCluster {
    async fn get_service(&self, id: &ResourceId) -> Result<Option<Service>, Error> {
        self.check("get service")?;
        Ok(self.service(id))
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        self.check("create service")?;
        let mut service = service.clone();
        let mut state = self.state();
        let is_node_port = service
            .spec
            .as_ref()
            .and_then(|spec| spec.type_.as_deref())
            .is_some_and(|t| t == "NodePort" || t == "LoadBalancer");
        if is_node_port {
            for port in service
                .spec
                .iter_mut()
                .flat_map(|spec| spec.ports.iter_mut().flatten())
            {
                port.node_port = Some(state.next_node_port);
                state.next_node_port += 1;
            }
        }
        let id = object_id(&service.metadata);
        state.operations.push(Operation::CreateService(id.clone()));
        state.services.insert(id, service);
        Ok(())
    }

    async fn delete_service(&self, id: &ResourceId) -> Result<bool, Error> {
        self.check("delete service")?;
        let mut state = self.state();
        let existed = state.services.remove(id).is_some();
        if existed {
            state.operations.push(Operation::DeleteService(id.clone()));
        }
        Ok(existed)
    }

    async fn get_workload(
        &self,
        id: &ResourceId,
        kind: WorkloadKind,
    ) -> Result<Option<Workload>, Error> {
        self.check(match kind {
            WorkloadKind::Deployment => "get deployment",
            WorkloadKind::StatefulSet => "get statefulset",
        })?;
        Ok(self.state().workloads.get(&(id.clone(), kind)).cloned())
    }

    async fn create_workload(&self, workload: &Workload) -> Result<(), Error> {
        self.check(match workload.kind() {
            WorkloadKind::Deployment => "create deployment",
            WorkloadKind::StatefulSet => "create statefulset",
        })?;
        let mut workload = workload.clone();
        let mut state = self.state();
        if state.auto_ready {
            let desired = workload.desired_replicas();
            workload.set_replicas(desired, desired);
        } else {
            workload.set_replicas(workload.desired_replicas(), 0);
        }
        let id = workload.id();
        state.operations.push(Operation::CreateWorkload(id.clone()));
        state.workloads.insert((id, workload.kind()), workload);
        Ok(())
    }

    async fn delete_workload(&self, id: &ResourceId, kind: WorkloadKind) -> Result<bool, Error> {
        self.check(match kind {
            WorkloadKind::Deployment => "delete deployment",
            WorkloadKind::StatefulSet => "delete statefulset",
        })?;
        let mut state = self.state();
        let existed = state.workloads.remove(&(id.clone(), kind)).is_some();
        if existed {
            state.operations.push(Operation::DeleteWorkload(id.clone()));
        }
        Ok(existed)
    }

    async fn list_node_addresses(&self) -> Result<Vec<String>, Error> {
        self.check("list nodes")?;
        Ok(self.state().node_addresses.clone())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<bool, Error> {
        self.check("create namespace")?;
        let mut state = self.state();
        let created = state.namespaces.insert(name.to_owned());
        if created {
            state
                .operations
                .push(Operation::CreateNamespace(name.to_owned()));
        }
        Ok(created)
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool, Error> {
        self.check("delete namespace")?;
        let mut state = self.state();
        let existed = state.namespaces.remove(name);
        if existed {
            state
                .operations
                .push(Operation::DeleteNamespace(name.to_owned()));
        }
        Ok(existed)
    }

    async fn port_forward(
        &self,
        id: &ResourceId,
        _remote_port: u16,
        local_port: u16,
    ) -> Result<Tunnel, Error> {
        self.inner.port_forward_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().port_forward_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check("port forward")?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        Ok(Tunnel::new(id.clone(), addr, None))
    }

    /// Succeeds when the service declares `remote_port` and a workload of
    /// the same name has a ready replica.
    async fn probe_port(&self, id: &ResourceId, remote_port: u16) -> Result<(), Error> {
        self.check("probe port")?;
        let state = self.state();
        let service = require_service(state.services.get(id).cloned(), id)?;
        let declared = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .is_some_and(|ports| ports.iter().any(|p| p.port == i32::from(remote_port)));
        if !declared {
            return Err(Error::UnknownServicePort {
                resource: id.clone(),
                port: remote_port,
            });
        }
        let ready = state
            .workloads
            .iter()
            .any(|((workload, _), w)| workload == id && w.ready_replicas() > 0);
        if ready {
            Ok(())
        } else {
            Err(Error::NoReadyPod {
                resource: id.clone(),
            })
        }
    }

    async fn logs(&self, id: &ResourceId, _kind: WorkloadKind) -> Result<String, Error> {
        self.check("read pod logs")?;
        Ok(self.state().logs.get(id).cloned().unwrap_or_default())
    }

    async fn exec(
        &self,
        id: &ResourceId,
        _kind: WorkloadKind,
        command: &[String],
    ) -> Result<ExecResult, Error> {
        self.check("exec in pod")?;
        let mut state = self.state();
        state.exec_calls.push(command.to_vec());
        Ok(state.exec_results.get(id).cloned().unwrap_or_default())
    }

    fn access_strategy(&self) -> &AccessStrategy {
        &self.inner.access
    }
}

/// A single-replica deployment selecting `app=<name>` with `ready` replicas
/// ready.
pub fn deployment(id: &ResourceId, ready: i32) -> Workload {
    Workload::Deployment(Deployment {
        metadata: ObjectMeta {
            name: Some(id.name.clone()),
            namespace: Some(id.namespace.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some([("app".to_owned(), id.name.clone())].into()),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            replicas: Some(1),
            ready_replicas: Some(ready),
            ..Default::default()
        }),
    })
}

fn service(id: &ResourceId, type_: &str, ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(id.name.clone()),
            namespace: Some(id.namespace.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_owned()),
            selector: Some([("app".to_owned(), id.name.clone())].into()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A `ClusterIP` service declaring `ports`.
pub fn cluster_ip_service(id: &ResourceId, ports: &[u16]) -> Service {
    service(
        id,
        "ClusterIP",
        ports
            .iter()
            .map(|port| ServicePort {
                port: i32::from(*port),
                ..Default::default()
            })
            .collect(),
    )
}

/// A `NodePort` service mapping each `(port, node_port)` pair.
pub fn node_port_service(id: &ResourceId, ports: &[(u16, u16)]) -> Service {
    service(
        id,
        "NodePort",
        ports
            .iter()
            .map(|(port, node_port)| ServicePort {
                port: i32::from(*port),
                node_port: Some(i32::from(*node_port)),
                ..Default::default()
            })
            .collect(),
    )
}

/// A `LoadBalancer` service declaring `port`, with an ingress entry when an
/// ip or hostname is given.
pub fn load_balancer_service(
    id: &ResourceId,
    port: u16,
    ip: Option<&str>,
    hostname: Option<&str>,
) -> Service {
    let mut service = service(
        id,
        "LoadBalancer",
        vec![ServicePort {
            port: i32::from(port),
            ..Default::default()
        }],
    );
    if ip.is_some() || hostname.is_some() {
        service.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: ip.map(ToOwned::to_owned),
                    hostname: hostname.map(ToOwned::to_owned),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
    }
    service
}
