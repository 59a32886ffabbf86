use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use shipyard::deploy::fsm::{AppStatus, DeploymentStatus};
use shipyard::deploy::pipeline::{Options, Pipeline};
use shipyard::deploy::webhook::PushEvent;
use shipyard::errors::PlatformError;
use shipyard::events::{Event, EventBus, EventType};
use shipyard::models::app::{Application, NewApplication};
use shipyard::store::{JsonRecordStore, RecordStore};

use crate::common::{wait_until, MockBuilder, MockDeployer, MockFetcher};

struct Harness {
    store: Arc<JsonRecordStore>,
    bus: Arc<EventBus>,
    fetcher: Arc<MockFetcher>,
    deployer: Arc<MockDeployer>,
    pipeline: Arc<Pipeline>,
}

fn harness(dir: &Path, builder: MockBuilder, options: Options) -> Harness {
    let store = Arc::new(JsonRecordStore::in_memory());
    let bus = Arc::new(EventBus::default());
    let fetcher = Arc::new(MockFetcher::new(dir));
    let deployer = Arc::new(MockDeployer::default());

    let pipeline = Arc::new(Pipeline::new(
        options,
        store.clone(),
        bus.clone(),
        fetcher.clone(),
        Arc::new(builder),
        deployer.clone(),
    ));

    Harness {
        store,
        bus,
        fetcher,
        deployer,
        pipeline,
    }
}

async fn create_app(store: &JsonRecordStore, name: &str, repo_url: &str, branch: &str) -> Application {
    store
        .create_app(NewApplication {
            name: name.to_string(),
            repo_url: repo_url.to_string(),
            branch: Some(branch.to_string()),
            domain: format!("{name}.example.com"),
            ..Default::default()
        })
        .await
        .unwrap()
}

fn record_events(bus: &EventBus, event_type: EventType) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe_fn(event_type, "recorder", move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().await.push(event);
        }
    });
    events
}

#[tokio::test]
async fn test_deploy_success_marks_app_running() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path(), MockBuilder::new(tmp.path().join("app")), Options::default());
    let deployed = record_events(&h.bus, EventType::AppDeployed);
    let app = create_app(&h.store, "web", "https://github.com/acme/web", "main").await;

    let deployment = h.pipeline.deploy_app(&app.id, "c1").await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Success);
    assert!(deployment.ended_at.is_some());
    assert!(deployment.log.contains("4000"));

    let stored = h.store.get_deployment(&deployment.id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::Success);

    let app_after = h.store.get_app(&app.id).await.unwrap();
    assert_eq!(app_after.status, AppStatus::Running);
    assert!(app_after.last_deploy.is_some());

    assert_eq!(
        *h.fetcher.calls.lock().await,
        vec![(
            "https://github.com/acme/web".to_string(),
            "main".to_string(),
            "c1".to_string()
        )]
    );
    assert_eq!(*h.deployer.deployed.lock().await, vec![app.id.clone()]);

    assert!(wait_until(Duration::from_secs(2), || async { deployed.lock().await.len() == 1 }).await);
    let events = deployed.lock().await;
    assert_eq!(events[0].app_id, app.id);
    assert_eq!(events[0].data_str("commit"), Some("c1"));
    assert_eq!(events[0].data_str("deployment_id"), Some(deployment.id.as_str()));
}

#[tokio::test]
async fn test_build_failure_records_failed_deployment() {
    let tmp = tempfile::tempdir().unwrap();
    let mut builder = MockBuilder::new(tmp.path().join("app"));
    builder.fail = true;
    let h = harness(tmp.path(), builder, Options::default());
    let failed = record_events(&h.bus, EventType::DeployFailed);
    let app = create_app(&h.store, "web", "https://github.com/acme/web", "main").await;

    let err = h.pipeline.deploy_app(&app.id, "c1").await.unwrap_err();
    assert!(err.to_string().contains("build failed"));

    let deployments = h.store.list_deployments(&app.id).await.unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].status, DeploymentStatus::Failed);
    assert!(deployments[0].log.contains("undefined: x"));
    assert!(deployments[0].ended_at.is_some());

    // a failed attempt leaves the recorded app status alone
    assert_eq!(h.store.get_app(&app.id).await.unwrap().status, AppStatus::Pending);
    assert!(h.deployer.deployed.lock().await.is_empty());

    assert!(wait_until(Duration::from_secs(2), || async { failed.lock().await.len() == 1 }).await);
    assert!(failed.lock().await[0].data_str("error").is_some());
}

#[tokio::test]
async fn test_fetch_failure_stops_before_build() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonRecordStore::in_memory());
    let deployer = Arc::new(MockDeployer::default());
    let mut fetcher = MockFetcher::new(tmp.path());
    fetcher.fail = true;
    let pipeline = Pipeline::new(
        Options::default(),
        store.clone(),
        Arc::new(EventBus::default()),
        Arc::new(fetcher),
        Arc::new(MockBuilder::new(tmp.path().join("app"))),
        deployer.clone(),
    );
    let app = create_app(&store, "web", "https://github.com/acme/web", "main").await;

    let err = pipeline.deploy_app(&app.id, "").await.unwrap_err();
    assert!(err.to_string().contains("source fetching failed"));
    assert!(deployer.deployed.lock().await.is_empty());
}

#[tokio::test]
async fn test_deploy_unknown_app_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path(), MockBuilder::new(tmp.path().join("app")), Options::default());

    let err = h.pipeline.deploy_app("ghost", "c1").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(h.fetcher.calls.lock().await.is_empty());
}

#[tokio::test]
async fn test_deploy_timeout_fails_deployment() {
    let tmp = tempfile::tempdir().unwrap();
    let mut builder = MockBuilder::new(tmp.path().join("app"));
    builder.delay = Duration::from_secs(5);
    let h = harness(
        tmp.path(),
        builder,
        Options {
            timeout: Duration::from_millis(100),
        },
    );
    let app = create_app(&h.store, "web", "https://github.com/acme/web", "main").await;

    let err = h.pipeline.deploy_app(&app.id, "c1").await.unwrap_err();
    assert!(matches!(err.root(), PlatformError::Timeout(_)));

    let deployments = h.store.list_deployments(&app.id).await.unwrap();
    assert_eq!(deployments[0].status, DeploymentStatus::Failed);
    assert!(h.deployer.deployed.lock().await.is_empty());
}

#[tokio::test]
async fn test_webhook_dispatches_matching_apps() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path(), MockBuilder::new(tmp.path().join("app")), Options::default());
    let web = create_app(&h.store, "web", "https://github.com/acme/web", "main").await;
    let worker = create_app(&h.store, "worker", "https://github.com/acme/web/", "main").await;
    create_app(&h.store, "staging", "https://github.com/acme/web", "develop").await;
    create_app(&h.store, "other", "https://github.com/acme/other", "main").await;

    let push = PushEvent {
        repo_url: "https://github.com/acme/web.git".to_string(),
        branch: "main".to_string(),
        commit: "abc123".to_string(),
    };
    let dispatched = h.pipeline.process_webhook(&push).await.unwrap();
    assert_eq!(dispatched, 2);

    assert!(wait_until(Duration::from_secs(2), || async { h.fetcher.calls.lock().await.len() == 2 }).await);
    assert!(h
        .fetcher
        .calls
        .lock()
        .await
        .iter()
        .all(|(_, branch, commit)| branch == "main" && commit == "abc123"));

    for app in [&web, &worker] {
        let done = wait_until(Duration::from_secs(2), || async {
            h.store.list_deployments(&app.id).await.unwrap()[0].status == DeploymentStatus::Success
        })
        .await;
        assert!(done);
    }
}

#[tokio::test]
async fn test_enqueue_returns_pending_deployment() {
    let tmp = tempfile::tempdir().unwrap();
    let mut builder = MockBuilder::new(tmp.path().join("app"));
    builder.delay = Duration::from_millis(100);
    let h = harness(tmp.path(), builder, Options::default());
    let app = create_app(&h.store, "web", "https://github.com/acme/web", "main").await;

    let queued = h.pipeline.enqueue_deploy(&app.id, "c1").await.unwrap();
    assert_eq!(queued.status, DeploymentStatus::Pending);

    let finished = wait_until(Duration::from_secs(2), || async {
        h.store.get_deployment(&queued.id).await.unwrap().status == DeploymentStatus::Success
    })
    .await;
    assert!(finished);
}

#[tokio::test]
async fn test_deploys_of_one_app_run_one_at_a_time() {
    let tmp = tempfile::tempdir().unwrap();
    let mut builder = MockBuilder::new(tmp.path().join("app"));
    builder.delay = Duration::from_millis(200);
    let h = harness(tmp.path(), builder, Options::default());
    let app = create_app(&h.store, "web", "https://github.com/acme/web", "main").await;

    let first = h.pipeline.enqueue_deploy(&app.id, "c1").await.unwrap();
    let second = h.pipeline.enqueue_deploy(&app.id, "c2").await.unwrap();

    // while one deploy builds, the other waits pending
    let started = wait_until(Duration::from_secs(1), || async {
        h.fetcher.calls.lock().await.len() == 1
    })
    .await;
    assert!(started);
    let statuses = [
        h.store.get_deployment(&first.id).await.unwrap().status,
        h.store.get_deployment(&second.id).await.unwrap().status,
    ];
    assert!(statuses.contains(&DeploymentStatus::InProgress));
    assert!(statuses.contains(&DeploymentStatus::Pending));

    let both_done = wait_until(Duration::from_secs(3), || async {
        h.deployer.deployed.lock().await.len() == 2
    })
    .await;
    assert!(both_done);
}

#[tokio::test]
async fn test_undeploy_missing_app_succeeds() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path(), MockBuilder::new(tmp.path().join("app")), Options::default());

    h.pipeline.undeploy_app("ghost").await.unwrap();
    assert_eq!(*h.deployer.undeployed.lock().await, vec!["ghost".to_string()]);
}

#[tokio::test]
async fn test_undeploy_marks_app_undeployed() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(tmp.path(), MockBuilder::new(tmp.path().join("app")), Options::default());
    let undeployed = record_events(&h.bus, EventType::AppUndeployed);
    let app = create_app(&h.store, "web", "https://github.com/acme/web", "main").await;
    h.pipeline.deploy_app(&app.id, "c1").await.unwrap();

    h.pipeline.undeploy_app(&app.id).await.unwrap();

    assert_eq!(h.store.get_app(&app.id).await.unwrap().status, AppStatus::Undeployed);
    assert_eq!(*h.deployer.undeployed.lock().await, vec![app.id.clone()]);
    assert!(wait_until(Duration::from_secs(2), || async { undeployed.lock().await.len() == 1 }).await);
}

#[tokio::test]
async fn test_app_locks_are_released_after_use() {
    let tmp = tempfile::tempdir().unwrap();
    let mut builder = MockBuilder::new(tmp.path().join("app"));
    builder.delay = Duration::from_millis(100);
    let h = harness(tmp.path(), builder, Options::default());
    let web = create_app(&h.store, "web", "https://github.com/acme/web", "main").await;
    let api = create_app(&h.store, "api", "https://github.com/acme/api", "main").await;

    h.pipeline.enqueue_deploy(&web.id, "c1").await.unwrap();
    h.pipeline.enqueue_deploy(&api.id, "c1").await.unwrap();
    let busy = wait_until(Duration::from_secs(1), || async { h.pipeline.tracked_locks().await == 2 }).await;
    assert!(busy);

    let drained = wait_until(Duration::from_secs(3), || async {
        h.deployer.deployed.lock().await.len() == 2 && h.pipeline.tracked_locks().await == 0
    })
    .await;
    assert!(drained);

    h.pipeline.undeploy_app(&web.id).await.unwrap();
    h.pipeline.undeploy_app("ghost").await.unwrap();
    assert_eq!(h.pipeline.tracked_locks().await, 0);
}
