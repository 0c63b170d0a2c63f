use async_trait::async_trait;
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        apps::v1::{Deployment, StatefulSet},
        core::v1::{Namespace, Node, Pod, Service},
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status},
};
use kube::{
    Api, Client, Resource,
    api::{AttachParams, DeleteParams, ListParams, LogParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    ApiSnafu, ClusterHandle, ConnectSnafu, Error, ExecResult, Tunnel, Workload, WorkloadKind,
    label_selector, require_service, tunnel,
};
use crate::{access::AccessStrategy, endpoint::ResourceId};

/// [`ClusterHandle`] backed by a live API server.
pub struct KubeCluster {
    client: Client,
    access: AccessStrategy,
}

impl KubeCluster {
    pub const fn new(client: Client, access: AccessStrategy) -> Self {
        Self { client, access }
    }

    /// Connects using the local kubeconfig or the in-cluster environment.
    pub async fn try_default(access: AccessStrategy) -> Result<Self, Error> {
        let client = Client::try_default().await.context(ConnectSnafu)?;
        Ok(Self::new(client, access))
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, id: &ResourceId, operation: &'static str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.namespaced::<K>(&id.namespace)
            .get_opt(&id.name)
            .await
            .context(ApiSnafu { operation })
    }

    async fn create<K>(&self, object: &K, operation: &'static str) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = object.meta().namespace.as_deref().unwrap_or("default");
        self.namespaced::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .context(ApiSnafu { operation })?;
        Ok(())
    }

    async fn delete<K>(&self, id: &ResourceId, operation: &'static str) -> Result<bool, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let result = self
            .namespaced::<K>(&id.namespace)
            .delete(&id.name, &DeleteParams::background())
            .await
            .context(ApiSnafu { operation });
        match result {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// The first running and ready pod selected by the workload, falling
    /// back to any selected pod so logs of crash-looping pods stay visible.
    async fn workload_pod(&self, id: &ResourceId, kind: WorkloadKind) -> Result<Pod, Error> {
        let workload = self
            .get_workload(id, kind)
            .await?
            .ok_or_else(|| Error::NoReadyPod {
                resource: id.clone(),
            })?;
        let selector = workload
            .selector()
            .filter(|labels| !labels.is_empty())
            .map(label_selector)
            .ok_or_else(|| Error::MissingSelector {
                resource: id.clone(),
            })?;
        let mut pods = self
            .namespaced::<Pod>(&id.namespace)
            .list(&ListParams::default().labels(&selector))
            .await
            .context(ApiSnafu {
                operation: "list pods",
            })?
            .items;
        match pods.iter().position(tunnel::is_ready) {
            Some(index) => Ok(pods.swap_remove(index)),
            None => pods.into_iter().next().ok_or_else(|| Error::NoReadyPod {
                resource: id.clone(),
            }),
        }
    }
}

#[async_trait]
impl ClusterHandle for KubeCluster {
    async fn get_service(&self, id: &ResourceId) -> Result<Option<Service>, Error> {
        self.get(id, "get service").await
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        self.create(service, "create service").await
    }

    async fn delete_service(&self, id: &ResourceId) -> Result<bool, Error> {
        self.delete::<Service>(id, "delete service").await
    }

    async fn get_workload(
        &self,
        id: &ResourceId,
        kind: WorkloadKind,
    ) -> Result<Option<Workload>, Error> {
        Ok(match kind {
            WorkloadKind::Deployment => self
                .get::<Deployment>(id, "get deployment")
                .await?
                .map(Workload::Deployment),
            WorkloadKind::StatefulSet => self
                .get::<StatefulSet>(id, "get statefulset")
                .await?
                .map(Workload::StatefulSet),
        })
    }

    async fn create_workload(&self, workload: &Workload) -> Result<(), Error> {
        match workload {
            Workload::Deployment(d) => self.create(d, "create deployment").await,
            Workload::StatefulSet(s) => self.create(s, "create statefulset").await,
        }
    }

    async fn delete_workload(&self, id: &ResourceId, kind: WorkloadKind) -> Result<bool, Error> {
        match kind {
            WorkloadKind::Deployment => self.delete::<Deployment>(id, "delete deployment").await,
            WorkloadKind::StatefulSet => {
                self.delete::<StatefulSet>(id, "delete statefulset").await
            }
        }
    }

    async fn list_node_addresses(&self) -> Result<Vec<String>, Error> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .context(ApiSnafu {
                operation: "list nodes",
            })?;
        Ok(nodes
            .items
            .iter()
            .filter_map(|node| {
                node.status
                    .as_ref()?
                    .addresses
                    .as_ref()?
                    .iter()
                    .find(|address| address.type_ == "InternalIP")
                    .map(|address| address.address.clone())
            })
            .collect())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<bool, Error> {
        let api = Api::<Namespace>::all(self.client.clone());
        if api
            .get_opt(name)
            .await
            .context(ApiSnafu {
                operation: "get namespace",
            })?
            .is_some()
        {
            return Ok(false);
        }
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &namespace)
            .await
            .context(ApiSnafu {
                operation: "create namespace",
            })?;
        Ok(true)
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool, Error> {
        let result = Api::<Namespace>::all(self.client.clone())
            .delete(name, &DeleteParams::background())
            .await
            .context(ApiSnafu {
                operation: "delete namespace",
            });
        match result {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn port_forward(
        &self,
        id: &ResourceId,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Tunnel, Error> {
        let service = require_service(self.get_service(id).await?, id)?;
        tunnel::open(
            self.namespaced::<Pod>(&id.namespace),
            &service,
            id.clone(),
            remote_port,
            local_port,
        )
        .await
    }

    async fn probe_port(&self, id: &ResourceId, remote_port: u16) -> Result<(), Error> {
        let service = require_service(self.get_service(id).await?, id)?;
        tunnel::probe(
            self.namespaced::<Pod>(&id.namespace),
            &service,
            id,
            remote_port,
        )
        .await
    }

    async fn logs(&self, id: &ResourceId, kind: WorkloadKind) -> Result<String, Error> {
        let pod = self.workload_pod(id, kind).await?;
        let name = pod.metadata.name.unwrap_or_default();
        self.namespaced::<Pod>(&id.namespace)
            .logs(&name, &LogParams::default())
            .await
            .context(ApiSnafu {
                operation: "read pod logs",
            })
    }

    async fn exec(
        &self,
        id: &ResourceId,
        kind: WorkloadKind,
        command: &[String],
    ) -> Result<ExecResult, Error> {
        let pod = self.workload_pod(id, kind).await?;
        let name = pod.metadata.name.unwrap_or_default();
        let exec_error = |message: String| Error::Exec {
            resource: id.clone(),
            message,
        };

        let mut process = self
            .namespaced::<Pod>(&id.namespace)
            .exec(
                &name,
                command.iter().map(String::as_str),
                &AttachParams::default().stdout(true).stderr(true),
            )
            .await
            .context(ApiSnafu {
                operation: "exec in pod",
            })?;

        let (stdout, stderr) = tokio::join!(
            read_output(process.stdout()),
            read_output(process.stderr())
        );
        let stdout = stdout.map_err(|e| exec_error(e.to_string()))?;
        let stderr = stderr.map_err(|e| exec_error(e.to_string()))?;
        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        process
            .join()
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        Ok(ExecResult {
            exit_code: exit_code(status.as_ref()),
            stdout,
            stderr,
        })
    }

    fn access_strategy(&self) -> &AccessStrategy {
        &self.access
    }
}

async fn read_output(reader: Option<impl AsyncRead + Unpin>) -> std::io::Result<String> {
    let mut output = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut output).await?;
    }
    Ok(output)
}

/// Decodes the exit code carried in the status frame of an exec session.
fn exit_code(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|code| code.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    use super::*;

    #[test]
    fn decodes_exit_codes() {
        assert_eq!(exit_code(None), -1);
        assert_eq!(
            exit_code(Some(&Status {
                status: Some("Success".into()),
                ..Default::default()
            })),
            0
        );
        let failure = Status {
            status: Some("Failure".into()),
            reason: Some("NonZeroExitCode".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("3".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(&failure)), 3);
        assert_eq!(
            exit_code(Some(&Status {
                status: Some("Failure".into()),
                ..Default::default()
            })),
            1
        );
    }
}
