#![cfg(feature = "e2e-tests")]
//! Runs against the cluster of the current kubeconfig context.

use std::{sync::Arc, time::Duration};

use testpods::{
    Error,
    access::AccessStrategy,
    builder::{ContainerSpec, ResourceSpec},
    cluster::{ClusterHandle, KubeCluster, WorkloadKind},
    endpoint::ResourceId,
    error::StartupStep,
    lifecycle::{LifecycleSettings, LifecycleState, ManagedResource, ResourceLifecycleController},
    namespace::TestNamespace,
    trace,
    wait::{HttpCheck, PollInterval, WaitStrategy},
};

const NGINX_IMAGE: &str = "nginx:1.27-alpine";

fn init() {
    trace::init(false, false, &trace::directives("debug"));
}

async fn cluster(access: AccessStrategy) -> Arc<dyn ClusterHandle> {
    Arc::new(KubeCluster::try_default(access).await.unwrap())
}

fn nginx(namespace: &str) -> ManagedResource {
    let spec = ResourceSpec::new(
        ResourceId::new(namespace, "nginx"),
        ContainerSpec::new(NGINX_IMAGE).with_port(80),
        80,
    );
    let mut check = HttpCheck::new(80);
    check.statuses = vec![200];
    ManagedResource::new(
        spec,
        WaitStrategy::all([WaitStrategy::Readiness, WaitStrategy::Http(check)]),
    )
}

fn settings(timeout: Duration) -> LifecycleSettings {
    LifecycleSettings {
        readiness_timeout: timeout,
        poll_interval: PollInterval::Fixed(Duration::from_secs(1)),
    }
}

#[tokio::test]
async fn port_forward_round_trip() {
    init();
    let cluster = cluster(AccessStrategy::port_forward()).await;
    let mut namespace = TestNamespace::generated(Arc::clone(&cluster), Some("e2e port forward"));
    namespace.create().await.unwrap();

    let controller = ResourceLifecycleController::new(Arc::clone(&cluster))
        .with_settings(settings(Duration::from_secs(180)));
    let mut resource = nginx(namespace.name());

    controller.start(&mut resource).await.unwrap();
    assert_eq!(resource.state(), LifecycleState::Ready);
    assert_eq!(resource.external_host().unwrap(), "127.0.0.1");
    assert!(controller.is_running(&resource).await.unwrap());
    assert!(controller.is_ready(&resource).await.unwrap());

    let url = format!("{}/", resource.endpoint().unwrap().to_url("http"));
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    controller.stop(&mut resource).await;
    assert_eq!(resource.state(), LifecycleState::Stopped);
    assert!(matches!(resource.external_port(), Err(Error::State { .. })));

    namespace.close().await.unwrap();
}

#[tokio::test]
async fn failed_start_is_rolled_back() {
    init();
    let cluster = cluster(AccessStrategy::port_forward()).await;
    let mut namespace = TestNamespace::generated(Arc::clone(&cluster), Some("e2e rollback"));
    namespace.create().await.unwrap();

    let controller = ResourceLifecycleController::new(Arc::clone(&cluster))
        .with_settings(settings(Duration::from_secs(20)));
    let id = ResourceId::new(namespace.name(), "missing-image");
    let spec = ResourceSpec::new(
        id.clone(),
        ContainerSpec::new("testpods.invalid/does-not-exist:0").with_port(8080),
        8080,
    );
    let mut resource = ManagedResource::new(spec, WaitStrategy::Readiness);

    match controller.start(&mut resource).await {
        Err(Error::Startup { step, source, .. }) => {
            assert_eq!(step, StartupStep::WaitReady);
            assert!(source.is_timeout());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(resource.state(), LifecycleState::Failed);
    assert!(resource.rollback_failures().is_empty());
    assert!(cluster.get_service(&id).await.unwrap().is_none());
    assert!(
        cluster
            .get_workload(&id, WorkloadKind::Deployment)
            .await
            .unwrap()
            .is_none()
    );

    namespace.close().await.unwrap();
}

#[tokio::test]
async fn statefulset_through_node_port() {
    init();
    let cluster = cluster(AccessStrategy::node_port(None)).await;
    let mut namespace = TestNamespace::generated(Arc::clone(&cluster), Some("e2e node port"));
    namespace.create().await.unwrap();

    let controller = ResourceLifecycleController::new(Arc::clone(&cluster))
        .with_settings(settings(Duration::from_secs(180)));
    let mut resource = nginx(namespace.name());
    let mut spec = resource.spec().clone();
    spec.kind = WorkloadKind::StatefulSet;
    resource = ManagedResource::new(spec, WaitStrategy::Readiness);

    controller.start(&mut resource).await.unwrap();
    let port = resource.external_port().unwrap();
    assert!(port >= 30000, "node port {} outside the default range", port);

    controller.stop(&mut resource).await;
    namespace.close().await.unwrap();
}
