//! Turns a declarative resource description into the Service and workload
//! objects submitted to the cluster.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, ExecAction, HTTPGetAction, PodSpec,
            PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec, TCPSocketAction,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use serde::{Deserialize, Serialize};

use crate::{
    cluster::{Workload, WorkloadKind},
    endpoint::ResourceId,
};

pub const APP_LABEL: &str = "app";
pub const PRIMARY_PORT_NAME: &str = "primary";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeAction {
    TcpSocket {
        port: u16,
    },
    HttpGet {
        port: u16,
        #[serde(default = "default_probe_path")]
        path: String,
    },
    Exec {
        command: Vec<String>,
    },
}

fn default_probe_path() -> String {
    "/".into()
}

/// Container readiness probe, evaluated by the kubelet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    #[serde(flatten)]
    pub action: ProbeAction,
    #[serde(default)]
    pub initial_delay_seconds: i32,
    #[serde(default = "default_period_seconds")]
    pub period_seconds: i32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i32,
}

const fn default_period_seconds() -> i32 {
    2
}

const fn default_failure_threshold() -> i32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub readiness_probe: Option<ProbeSpec>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            command: Vec::new(),
            args: Vec::new(),
            readiness_probe: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Everything needed to build the objects of one managed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub kind: WorkloadKind,
    pub labels: BTreeMap<String, String>,
    pub container: ContainerSpec,
    /// The port resolved for external access.
    pub internal_port: u16,
}

impl ResourceSpec {
    pub fn new(id: ResourceId, container: ContainerSpec, internal_port: u16) -> Self {
        Self {
            id,
            kind: WorkloadKind::Deployment,
            labels: BTreeMap::new(),
            container,
            internal_port,
        }
    }

    /// Labels set on every object; `app=<name>` always wins.
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(APP_LABEL.into(), self.id.name.clone());
        labels
    }

    fn selector(&self) -> BTreeMap<String, String> {
        [(APP_LABEL.to_owned(), self.id.name.clone())].into()
    }

    /// Declared ports with the internal port first.
    fn ports(&self) -> Vec<u16> {
        let mut ports = vec![self.internal_port];
        ports.extend(
            self.container
                .ports
                .iter()
                .copied()
                .filter(|port| *port != self.internal_port),
        );
        ports
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.id.name.clone()),
            namespace: Some(self.id.namespace.clone()),
            labels: Some(self.all_labels()),
            ..Default::default()
        }
    }
}

fn port_name(spec: &ResourceSpec, port: u16) -> String {
    if port == spec.internal_port {
        PRIMARY_PORT_NAME.into()
    } else {
        format!("port-{}", port)
    }
}

/// Produces the descriptors the lifecycle controller submits.
pub trait ResourceBuilder: Send + Sync {
    fn build_service(&self, spec: &ResourceSpec, service_type: &str) -> Service;

    fn build_workload(&self, spec: &ResourceSpec) -> Workload;
}

/// One replica, one container, a service selecting `app=<name>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardBuilder;

impl StandardBuilder {
    fn container(&self, spec: &ResourceSpec) -> Container {
        let container = &spec.container;
        Container {
            name: spec.id.name.clone(),
            image: Some(container.image.clone()),
            ports: Some(
                spec.ports()
                    .into_iter()
                    .map(|port| ContainerPort {
                        name: Some(port_name(spec, port)),
                        container_port: i32::from(port),
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            env: (!container.env.is_empty()).then(|| {
                container
                    .env
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        ..Default::default()
                    })
                    .collect()
            }),
            command: (!container.command.is_empty()).then(|| container.command.clone()),
            args: (!container.args.is_empty()).then(|| container.args.clone()),
            readiness_probe: container.readiness_probe.as_ref().map(probe),
            ..Default::default()
        }
    }

    fn template(&self, spec: &ResourceSpec) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(spec.all_labels()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![self.container(spec)],
                ..Default::default()
            }),
        }
    }
}

impl ResourceBuilder for StandardBuilder {
    fn build_service(&self, spec: &ResourceSpec, service_type: &str) -> Service {
        Service {
            metadata: spec.metadata(),
            spec: Some(ServiceSpec {
                type_: Some(service_type.to_owned()),
                selector: Some(spec.selector()),
                ports: Some(
                    spec.ports()
                        .into_iter()
                        .map(|port| ServicePort {
                            name: Some(port_name(spec, port)),
                            port: i32::from(port),
                            target_port: Some(IntOrString::Int(i32::from(port))),
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_workload(&self, spec: &ResourceSpec) -> Workload {
        let selector = LabelSelector {
            match_labels: Some(spec.selector()),
            ..Default::default()
        };
        match spec.kind {
            WorkloadKind::Deployment => Workload::Deployment(Deployment {
                metadata: spec.metadata(),
                spec: Some(DeploymentSpec {
                    replicas: Some(1),
                    selector,
                    template: self.template(spec),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            WorkloadKind::StatefulSet => Workload::StatefulSet(StatefulSet {
                metadata: spec.metadata(),
                spec: Some(StatefulSetSpec {
                    replicas: Some(1),
                    selector,
                    service_name: spec.id.name.clone(),
                    template: self.template(spec),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }
}

fn probe(spec: &ProbeSpec) -> Probe {
    let mut probe = Probe {
        initial_delay_seconds: Some(spec.initial_delay_seconds),
        period_seconds: Some(spec.period_seconds),
        failure_threshold: Some(spec.failure_threshold),
        ..Default::default()
    };
    match &spec.action {
        ProbeAction::TcpSocket { port } => {
            probe.tcp_socket = Some(TCPSocketAction {
                port: IntOrString::Int(i32::from(*port)),
                ..Default::default()
            });
        }
        ProbeAction::HttpGet { port, path } => {
            probe.http_get = Some(HTTPGetAction {
                port: IntOrString::Int(i32::from(*port)),
                path: Some(path.clone()),
                ..Default::default()
            });
        }
        ProbeAction::Exec { command } => {
            probe.exec = Some(ExecAction {
                command: Some(command.clone()),
            });
        }
    }
    probe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ResourceSpec {
        let mut spec = ResourceSpec::new(
            ResourceId::new("testpods-it", "postgres"),
            ContainerSpec::new("postgres:16-alpine")
                .with_port(9187)
                .with_port(5432)
                .with_env("POSTGRES_PASSWORD", "secret"),
            5432,
        );
        spec.labels.insert("team".into(), "data".into());
        spec.labels.insert(APP_LABEL.into(), "overridden".into());
        spec
    }

    #[test]
    fn service_selects_app_and_names_primary_port() {
        let service = StandardBuilder.build_service(&spec(), "NodePort");
        let service_spec = service.spec.unwrap();

        assert_eq!(service.metadata.name.as_deref(), Some("postgres"));
        assert_eq!(service.metadata.namespace.as_deref(), Some("testpods-it"));
        assert_eq!(service_spec.type_.as_deref(), Some("NodePort"));
        similar_asserts::assert_eq!(
            service_spec.selector.unwrap(),
            BTreeMap::from([("app".to_owned(), "postgres".to_owned())])
        );
        let ports: Vec<_> = service_spec
            .ports
            .unwrap()
            .into_iter()
            .map(|p| (p.name.unwrap(), p.port))
            .collect();
        assert_eq!(
            ports,
            vec![("primary".to_owned(), 5432), ("port-9187".to_owned(), 9187)]
        );
    }

    #[test]
    fn deployment_runs_one_replica_of_the_container() {
        let Workload::Deployment(deployment) = StandardBuilder.build_workload(&spec()) else {
            panic!("expected a deployment");
        };
        let deployment_spec = deployment.spec.unwrap();
        assert_eq!(deployment_spec.replicas, Some(1));
        assert_eq!(
            deployment.metadata.labels.unwrap().get("app").map(String::as_str),
            Some("postgres")
        );

        let pod = deployment_spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("postgres:16-alpine"));
        assert_eq!(container.env.as_ref().unwrap()[0].name, "POSTGRES_PASSWORD");
        assert_eq!(container.command, None);
        assert_eq!(container.ports.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn stateful_set_references_its_service() {
        let mut spec = spec();
        spec.kind = WorkloadKind::StatefulSet;
        spec.container.readiness_probe = Some(ProbeSpec {
            action: ProbeAction::Exec {
                command: vec!["pg_isready".into()],
            },
            initial_delay_seconds: 0,
            period_seconds: 2,
            failure_threshold: 3,
        });

        let workload = StandardBuilder.build_workload(&spec);
        assert_eq!(workload.kind(), WorkloadKind::StatefulSet);
        let Workload::StatefulSet(stateful_set) = workload else {
            unreachable!();
        };
        let stateful_spec = stateful_set.spec.unwrap();
        assert_eq!(stateful_spec.service_name, "postgres");
        let probe = stateful_spec.template.spec.unwrap().containers[0]
            .readiness_probe
            .clone()
            .unwrap();
        assert_eq!(
            probe.exec.unwrap().command,
            Some(vec!["pg_isready".to_owned()])
        );
    }
}
