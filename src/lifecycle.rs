//! Moves a managed resource from "not started" to "externally reachable"
//! and back.

use std::{fmt, sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    Error,
    builder::{ResourceBuilder, ResourceSpec, StandardBuilder},
    cluster::{ClusterHandle, WorkloadKind},
    endpoint::{ExternalEndpoint, ResourceId},
    error::StartupStep,
    internal_events::{
        ResourceCreated, ResourceDeleteFailed, ResourceDeleted, ResourceReady, ResourceStarting,
        ResourceStartFailed, ResourceStopped, RollbackStepFailed,
    },
    wait::{PollInterval, WaitContext, WaitStrategy},
};

pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Creating,
    WaitingReady,
    ResolvingAccess,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not started",
            LifecycleState::Creating => "creating",
            LifecycleState::WaitingReady => "waiting for readiness",
            LifecycleState::ResolvingAccess => "resolving access",
            LifecycleState::Ready => "ready",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    /// States from which a fresh `start` may begin.
    pub const fn can_start(self) -> bool {
        matches!(
            self,
            LifecycleState::NotStarted | LifecycleState::Failed | LifecycleState::Stopped
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One test dependency. Its state is only changed by
/// [`ResourceLifecycleController`].
#[derive(Debug)]
pub struct ManagedResource {
    spec: ResourceSpec,
    wait: WaitStrategy,
    state: LifecycleState,
    endpoint: Option<ExternalEndpoint>,
    rollback_failures: Vec<String>,
}

impl ManagedResource {
    pub fn new(spec: ResourceSpec, wait: WaitStrategy) -> Self {
        Self {
            spec,
            wait,
            state: LifecycleState::NotStarted,
            endpoint: None,
            rollback_failures: Vec::new(),
        }
    }

    pub const fn id(&self) -> &ResourceId {
        &self.spec.id
    }

    pub const fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub const fn wait_strategy(&self) -> &WaitStrategy {
        &self.wait
    }

    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Failures recorded while rolling back the last failed start.
    pub fn rollback_failures(&self) -> &[String] {
        &self.rollback_failures
    }

    pub fn endpoint(&self) -> Result<&ExternalEndpoint, Error> {
        match (&self.endpoint, self.state) {
            (Some(endpoint), LifecycleState::Ready) => Ok(endpoint),
            _ => Err(self.state_error("read the endpoint of")),
        }
    }

    pub fn external_host(&self) -> Result<&str, Error> {
        self.endpoint().map(ExternalEndpoint::host)
    }

    pub fn external_port(&self) -> Result<u16, Error> {
        self.endpoint().map(ExternalEndpoint::port)
    }

    fn state_error(&self, operation: &'static str) -> Error {
        Error::State {
            resource: self.spec.id.clone(),
            operation,
            state: self.state.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub readiness_timeout: Duration,
    pub poll_interval: PollInterval,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            poll_interval: PollInterval::default(),
        }
    }
}

/// Compensations for completed start steps, run last-in first-out.
#[derive(Debug)]
enum UndoAction {
    DeleteService(ResourceId),
    DeleteWorkload(ResourceId, WorkloadKind),
    ReleaseAccess(ResourceId),
}

pub struct ResourceLifecycleController {
    cluster: Arc<dyn ClusterHandle>,
    builder: Arc<dyn ResourceBuilder>,
    settings: LifecycleSettings,
}

impl ResourceLifecycleController {
    pub fn new(cluster: Arc<dyn ClusterHandle>) -> Self {
        Self {
            cluster,
            builder: Arc::new(StandardBuilder),
            settings: LifecycleSettings::default(),
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn ResourceBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub const fn with_settings(mut self, settings: LifecycleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn cluster(&self) -> &dyn ClusterHandle {
        self.cluster.as_ref()
    }

    /// Creates the service and the workload, waits for readiness and
    /// resolves the external endpoint.
    ///
    /// On failure every object created so far is deleted, newest first,
    /// before the error is returned. Rollback failures are recorded on the
    /// resource and never replace the original cause.
    pub async fn start(&self, resource: &mut ManagedResource) -> Result<(), Error> {
        if !resource.state.can_start() {
            return Err(resource.state_error("start"));
        }
        let id = resource.spec.id.clone();
        resource.state = LifecycleState::Creating;
        resource.endpoint = None;
        resource.rollback_failures.clear();
        emit!(ResourceStarting {
            resource: &id,
            strategy: self.cluster.access_strategy().name()
        });

        let started = Instant::now();
        let mut undo = Vec::new();
        match self.run_start(resource, &mut undo).await {
            Ok(endpoint) => {
                emit!(ResourceReady {
                    resource: &id,
                    endpoint: &endpoint,
                    elapsed: started.elapsed()
                });
                resource.endpoint = Some(endpoint);
                resource.state = LifecycleState::Ready;
                Ok(())
            }
            Err((step, error)) => {
                resource.state = LifecycleState::Failed;
                resource.rollback_failures = self.rollback(undo).await;
                emit!(ResourceStartFailed {
                    resource: &id,
                    step,
                    error: &error,
                    rollback_failures: resource.rollback_failures.len()
                });
                Err(Error::Startup {
                    resource: id,
                    step,
                    rollback_failures: resource.rollback_failures.len(),
                    source: Box::new(error),
                })
            }
        }
    }

    async fn run_start(
        &self,
        resource: &mut ManagedResource,
        undo: &mut Vec<UndoAction>,
    ) -> Result<ExternalEndpoint, (StartupStep, Error)> {
        let cluster = self.cluster.as_ref();
        let access = cluster.access_strategy();
        let spec = &resource.spec;
        let id = &spec.id;

        let service = self.builder.build_service(spec, access.service_type());
        cluster
            .create_service(&service)
            .await
            .map_err(|error| (StartupStep::CreateNetworkResource, Error::from(error)))?;
        undo.push(UndoAction::DeleteService(id.clone()));
        emit!(ResourceCreated {
            resource: id,
            kind: "service"
        });

        let workload = self.builder.build_workload(spec);
        cluster
            .create_workload(&workload)
            .await
            .map_err(|error| (StartupStep::CreateWorkload, Error::from(error)))?;
        undo.push(UndoAction::DeleteWorkload(id.clone(), spec.kind));
        emit!(ResourceCreated {
            resource: id,
            kind: spec.kind.as_str()
        });

        // Port and HTTP checks resolve access while waiting, so anything they
        // open must be released on rollback as well.
        undo.push(UndoAction::ReleaseAccess(id.clone()));

        resource.state = LifecycleState::WaitingReady;
        let spec = &resource.spec;
        let id = &spec.id;
        let cx = WaitContext {
            cluster,
            resource: id,
            kind: spec.kind,
            interval: self.settings.poll_interval,
        };
        let deadline = Instant::now() + self.settings.readiness_timeout;
        resource
            .wait
            .wait(&cx, deadline)
            .await
            .map_err(|error| (StartupStep::WaitReady, error))?;

        resource.state = LifecycleState::ResolvingAccess;
        let spec = &resource.spec;
        access
            .resolve(cluster, &spec.id, spec.internal_port)
            .await
            .map_err(|error| (StartupStep::ResolveAccess, error))
    }

    /// Runs every compensation, newest first, collecting failures.
    async fn rollback(&self, mut undo: Vec<UndoAction>) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some(action) = undo.pop() {
            let result = match &action {
                UndoAction::DeleteService(id) => self.cluster.delete_service(id).await,
                UndoAction::DeleteWorkload(id, kind) => {
                    self.cluster.delete_workload(id, *kind).await
                }
                UndoAction::ReleaseAccess(id) => {
                    self.cluster.access_strategy().cleanup(id);
                    Ok(true)
                }
            };
            if let Err(error) = result {
                emit!(RollbackStepFailed {
                    action: &action,
                    error: &error
                });
                failures.push(format!("{:?}: {}", action, error));
            }
        }
        failures
    }

    /// Deletes the workload and the service and releases access handles.
    /// Never fails; individual failures are logged and skipped. Calling it
    /// again after it completed does nothing.
    pub async fn stop(&self, resource: &mut ManagedResource) {
        match resource.state {
            LifecycleState::NotStarted | LifecycleState::Stopped => return,
            _ => {}
        }
        resource.state = LifecycleState::Stopping;
        let id = resource.spec.id.clone();
        let kind = resource.spec.kind;

        match self.cluster.delete_workload(&id, kind).await {
            Ok(deleted) => emit!(ResourceDeleted {
                resource: &id,
                kind: kind.as_str(),
                existed: deleted
            }),
            Err(error) => emit!(ResourceDeleteFailed {
                resource: &id,
                kind: kind.as_str(),
                error: &error
            }),
        }
        match self.cluster.delete_service(&id).await {
            Ok(deleted) => emit!(ResourceDeleted {
                resource: &id,
                kind: "service",
                existed: deleted
            }),
            Err(error) => emit!(ResourceDeleteFailed {
                resource: &id,
                kind: "service",
                error: &error
            }),
        }
        self.cluster.access_strategy().cleanup(&id);

        resource.endpoint = None;
        resource.state = LifecycleState::Stopped;
        emit!(ResourceStopped { resource: &id });
    }

    /// Whether the workload exists and reports at least one replica.
    pub async fn is_running(&self, resource: &ManagedResource) -> Result<bool, Error> {
        let spec = &resource.spec;
        Ok(self
            .cluster
            .get_workload(&spec.id, spec.kind)
            .await?
            .is_some_and(|workload| workload.replicas() > 0))
    }

    /// Whether the workload exists and all desired replicas are ready.
    pub async fn is_ready(&self, resource: &ManagedResource) -> Result<bool, Error> {
        let spec = &resource.spec;
        Ok(self
            .cluster
            .get_workload(&spec.id, spec.kind)
            .await?
            .is_some_and(|workload| workload.ready_replicas() == workload.desired_replicas()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        access::AccessStrategy,
        builder::ContainerSpec,
        test_util::{FakeCluster, Operation},
    };

    fn resource(name: &str) -> ManagedResource {
        ManagedResource::new(
            ResourceSpec::new(
                ResourceId::new("testpods-lc", name),
                ContainerSpec::new("redis:7").with_port(6379),
                6379,
            ),
            WaitStrategy::Readiness,
        )
    }

    fn controller(cluster: &FakeCluster) -> ResourceLifecycleController {
        ResourceLifecycleController::new(Arc::new(cluster.clone())).with_settings(
            LifecycleSettings {
                readiness_timeout: Duration::from_secs(2),
                poll_interval: PollInterval::Fixed(Duration::from_millis(100)),
            },
        )
    }

    fn id(name: &str) -> ResourceId {
        ResourceId::new("testpods-lc", name)
    }

    #[tokio::test(start_paused = true)]
    async fn start_makes_resource_reachable() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let controller = controller(&cluster);
        let mut redis = resource("redis");

        controller.start(&mut redis).await.unwrap();

        assert_eq!(redis.state(), LifecycleState::Ready);
        assert_eq!(redis.external_host().unwrap(), "127.0.0.1");
        assert!(redis.external_port().unwrap() > 0);
        assert!(cluster.service(&id("redis")).is_some());
        assert!(controller.is_running(&redis).await.unwrap());
        assert!(controller.is_ready(&redis).await.unwrap());
        assert_eq!(cluster.port_forward_calls(), 1);
        similar_asserts::assert_eq!(
            cluster.operations(),
            vec![
                Operation::CreateService(id("redis")),
                Operation::CreateWorkload(id("redis")),
            ]
        );
    }

    #[tokio::test]
    async fn endpoint_is_unavailable_before_start() {
        let redis = resource("redis");
        assert!(matches!(redis.external_host(), Err(Error::State { .. })));
        assert!(matches!(redis.external_port(), Err(Error::State { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn start_from_ready_is_a_state_error() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let controller = controller(&cluster);
        let mut redis = resource("redis");
        controller.start(&mut redis).await.unwrap();

        let error = controller.start(&mut redis).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Cannot start testpods-lc/redis: resource is ready."
        );
        assert_eq!(redis.state(), LifecycleState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_workload_creation_removes_the_service() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        cluster.fail_on("create deployment");
        let controller = controller(&cluster);
        let mut redis = resource("redis");

        let error = controller.start(&mut redis).await.unwrap_err();

        assert!(matches!(
            error,
            Error::Startup {
                step: StartupStep::CreateWorkload,
                rollback_failures: 0,
                ..
            }
        ));
        assert!(matches!(error.root(), Error::Cluster { .. }));
        assert_eq!(redis.state(), LifecycleState::Failed);
        assert!(cluster.service(&id("redis")).is_none());
        assert!(matches!(redis.external_host(), Err(Error::State { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_rolls_back_in_reverse_order() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        cluster.set_auto_ready(false);
        let controller = controller(&cluster);
        let mut redis = resource("redis");

        let started = Instant::now();
        let error = controller.start(&mut redis).await.unwrap_err();

        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(matches!(
            error,
            Error::Startup {
                step: StartupStep::WaitReady,
                ..
            }
        ));
        assert!(error.root().is_timeout());
        similar_asserts::assert_eq!(
            cluster.operations(),
            vec![
                Operation::CreateService(id("redis")),
                Operation::CreateWorkload(id("redis")),
                Operation::DeleteWorkload(id("redis")),
                Operation::DeleteService(id("redis")),
            ]
        );
        assert!(!controller.is_running(&redis).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_failures_do_not_mask_the_cause() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        cluster.fail_on("port forward");
        cluster.fail_on("delete deployment");
        let controller = controller(&cluster);
        let mut redis = resource("redis");

        let error = controller.start(&mut redis).await.unwrap_err();

        match &error {
            Error::Startup {
                step,
                rollback_failures,
                source,
                ..
            } => {
                assert_eq!(*step, StartupStep::ResolveAccess);
                assert_eq!(*rollback_failures, 1);
                assert!(matches!(**source, Error::Access { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(redis.rollback_failures().len(), 1);
        // The service is still deleted after the workload deletion failed.
        assert!(cluster.service(&id("redis")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resource_can_start_again() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        cluster.fail_on("create service");
        let controller = controller(&cluster);
        let mut redis = resource("redis");

        let error = controller.start(&mut redis).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Startup {
                step: StartupStep::CreateNetworkResource,
                ..
            }
        ));
        assert!(cluster.operations().is_empty());

        cluster.clear_failures();
        controller.start(&mut redis).await.unwrap();
        assert_eq!(redis.state(), LifecycleState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_clears_the_cache() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let controller = controller(&cluster);
        let mut redis = resource("redis");
        controller.start(&mut redis).await.unwrap();
        assert!(cluster.access_strategy().cached(&id("redis"), 6379));

        controller.stop(&mut redis).await;
        controller.stop(&mut redis).await;

        assert_eq!(redis.state(), LifecycleState::Stopped);
        assert!(!cluster.access_strategy().cached(&id("redis"), 6379));
        assert!(cluster.service(&id("redis")).is_none());
        assert!(!controller.is_running(&redis).await.unwrap());
        assert!(!controller.is_ready(&redis).await.unwrap());
        assert!(matches!(redis.external_port(), Err(Error::State { .. })));
        assert_eq!(
            cluster
                .operations()
                .iter()
                .filter(|op| matches!(op, Operation::DeleteService(_)))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_continues_past_failures() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let controller = controller(&cluster);
        let mut redis = resource("redis");
        controller.start(&mut redis).await.unwrap();

        cluster.fail_on("delete deployment");
        controller.stop(&mut redis).await;

        assert_eq!(redis.state(), LifecycleState::Stopped);
        assert!(cluster.service(&id("redis")).is_none());
        assert!(!cluster.access_strategy().cached(&id("redis"), 6379));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_resource_can_restart() {
        let cluster = FakeCluster::new(AccessStrategy::node_port(Some("10.1.0.4".into())));
        let controller = controller(&cluster);
        let mut redis = resource("redis");

        controller.start(&mut redis).await.unwrap();
        assert_eq!(redis.external_host().unwrap(), "10.1.0.4");
        assert!(redis.external_port().unwrap() >= 30000);
        controller.stop(&mut redis).await;
        controller.start(&mut redis).await.unwrap();
        assert_eq!(redis.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn queries_are_false_for_missing_workloads() {
        let cluster = FakeCluster::new(AccessStrategy::port_forward());
        let controller = controller(&cluster);
        let redis = resource("redis");
        assert!(!controller.is_running(&redis).await.unwrap());
        assert!(!controller.is_ready(&redis).await.unwrap());
    }
}
