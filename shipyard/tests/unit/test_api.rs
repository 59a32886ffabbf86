use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use shipyard::deploy::fsm::DeploymentStatus;
use shipyard::deploy::pipeline::{self, Pipeline};
use shipyard::events::EventBus;
use shipyard::reconcile::{backup, proxy, BackupManager, ProxyManager};
use shipyard::server::serve::router;
use shipyard::server::state::ServerState;
use shipyard::store::{JsonRecordStore, RecordStore};
use shipyard::supervisor::{self, Supervisor};

use crate::common::{wait_until, MockBuilder, MockDeployer, MockFetcher};

struct TestApi {
    router: Router,
    store: Arc<JsonRecordStore>,
    proxy: Arc<ProxyManager>,
}

fn test_api(dir: &Path) -> TestApi {
    let store = Arc::new(JsonRecordStore::in_memory());
    let bus = Arc::new(EventBus::default());

    let pipeline = Arc::new(Pipeline::new(
        pipeline::Options::default(),
        store.clone(),
        bus.clone(),
        Arc::new(MockFetcher::new(dir)),
        Arc::new(MockBuilder::new(dir.join("app"))),
        Arc::new(MockDeployer::default()),
    ));
    let supervisor = Supervisor::new(
        supervisor::Options {
            apps_dir: dir.join("apps"),
            ..Default::default()
        },
        bus.clone(),
    );
    // never started, so reloads are skipped
    let proxy = Arc::new(
        ProxyManager::new(
            proxy::Options {
                config_file: dir.join("caddy.json"),
                ..Default::default()
            },
            bus.clone(),
        )
        .unwrap(),
    );
    let backup = Arc::new(BackupManager::new(
        backup::Options {
            enabled: false,
            config_file: dir.join("litestream.yml"),
            ..Default::default()
        },
        bus,
    ));

    let state = ServerState::new(store.clone(), pipeline, supervisor, proxy.clone(), backup);
    TestApi {
        router: router(Arc::new(state)),
        store,
        proxy,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook(event: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/github")
        .header("X-GitHub-Event", event)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn register_app(api: &TestApi) -> String {
    let (status, body) = send(
        &api.router,
        post_json(
            "/apps",
            &json!({
                "name": "web",
                "repo_url": "https://github.com/acme/web",
                "domain": "web.example.com"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());

    let (status, body) = send(&api.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "shipyard");
}

#[tokio::test]
async fn test_create_and_fetch_app() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());
    let app_id = register_app(&api).await;

    let (status, body) = send(&api.router, get(&format!("/apps/{app_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "web");
    assert_eq!(body["branch"], "main");
    assert_eq!(body["status"], "pending");

    let (status, body) = send(&api.router, get("/apps")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(&api.router, get(&format!("/apps/{app_id}/status"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert!(body["process"].is_null());
}

#[tokio::test]
async fn test_create_app_rejects_blank_name() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());

    let (status, body) = send(
        &api.router,
        post_json("/apps", &json!({ "name": " ", "repo_url": "https://github.com/acme/web" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("name is required"));
}

#[tokio::test]
async fn test_unknown_app_is_404() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());

    let (status, body) = send(&api.router, get("/apps/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = send(&api.router, post_json("/apps/ghost/deploy", &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&api.router, get("/deployments/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&api.router, post_json("/apps/ghost/restart", &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deploy_is_accepted_and_completes() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());
    let app_id = register_app(&api).await;

    let (status, body) = send(&api.router, post_json(&format!("/apps/{app_id}/deploy"), &json!({ "commit": "c1" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["commit"], "c1");
    let deployment_id = body["id"].as_str().unwrap().to_string();

    let done = wait_until(Duration::from_secs(2), || async {
        matches!(
            api.store.get_deployment(&deployment_id).await,
            Ok(d) if d.status == DeploymentStatus::Success
        )
    })
    .await;
    assert!(done);

    let (status, body) = send(&api.router, get(&format!("/deployments/{deployment_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let (status, body) = send(&api.router, get(&format!("/apps/{app_id}/deployments"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_deploy_without_body_uses_branch_head() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());
    let app_id = register_app(&api).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/apps/{app_id}/deploy"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["commit"], "");
}

#[tokio::test]
async fn test_deploy_rejects_malformed_body() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());
    let app_id = register_app(&api).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/apps/{app_id}/deploy"))
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_app() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());
    let app_id = register_app(&api).await;

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/apps/{app_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());

    let (status, _) = send(&api.router, get(&format!("/apps/{app_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_ping_and_ignored_events() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());

    let (status, body) = send(&api.router, webhook("ping", &json!({ "zen": "Keep it simple." }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pong");

    let (status, body) = send(&api.router, webhook("issues", &json!({ "action": "opened" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");

    let (status, _) = send(&api.router, post_json("/webhooks/github", &json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_push_dispatches_deploys() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());
    let app_id = register_app(&api).await;

    let payload = json!({
        "ref": "refs/heads/main",
        "repository": { "html_url": "https://github.com/acme/web" },
        "head_commit": { "id": "abc123" }
    });
    let (status, body) = send(&api.router, webhook("push", &payload)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["deployments"], 1);

    let deployments = api.store.list_deployments(&app_id).await.unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].commit, "abc123");

    let other_branch = json!({
        "ref": "refs/heads/develop",
        "repository": { "html_url": "https://github.com/acme/web" },
        "head_commit": { "id": "def456" }
    });
    let (_, body) = send(&api.router, webhook("push", &other_branch)).await;
    assert_eq!(body["deployments"], 0);
}

#[tokio::test]
async fn test_routes_and_restore_without_database() {
    let tmp = tempfile::tempdir().unwrap();
    let api = test_api(tmp.path());
    let app_id = register_app(&api).await;

    api.proxy.add_route(&app_id, "web.example.com", 4000).await.unwrap();

    let (status, body) = send(&api.router, get("/routes")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[&app_id]["domain"], "web.example.com");
    assert_eq!(body[&app_id]["port"], 4000);

    let (status, _) = send(&api.router, post_json(&format!("/apps/{app_id}/restore"), &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&api.router, get(&format!("/apps/{app_id}/backups"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}
