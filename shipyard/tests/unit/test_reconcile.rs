use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use shipyard::events::EventBus;
use shipyard::reconcile::{backup, proxy, BackupManager, ProxyManager};

use crate::common::{wait_until, write_script};

/// Stand-in for the proxy's admin endpoint
#[derive(Clone, Default)]
struct FakeAdmin {
    loads: Arc<Mutex<Vec<Value>>>,
    fail: Arc<AtomicBool>,
}

impl FakeAdmin {
    fn loads(&self) -> Vec<Value> {
        self.loads.lock().unwrap().clone()
    }
}

async fn load(State(admin): State<FakeAdmin>, Json(config): Json<Value>) -> StatusCode {
    if admin.fail.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    admin.loads.lock().unwrap().push(config);
    StatusCode::OK
}

async fn current_config() -> Json<Value> {
    Json(json!({}))
}

async fn spawn_admin() -> (String, FakeAdmin) {
    let admin = FakeAdmin::default();
    let app = Router::new()
        .route("/load", post(load))
        .route("/config/", get(current_config))
        .with_state(admin.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, admin)
}

fn proxy_manager(dir: &Path, admin_addr: &str) -> ProxyManager {
    ProxyManager::new(
        proxy::Options {
            admin_addr: admin_addr.to_string(),
            manage_process: false,
            config_file: dir.join("caddy.json"),
            ..Default::default()
        },
        Arc::new(EventBus::default()),
    )
    .unwrap()
}

fn hosts(config: &Value) -> Vec<String> {
    config["apps"]["http"]["servers"]["main"]["routes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|route| route["match"][0]["host"][0].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_proxy_posts_full_config_on_every_change() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, admin) = spawn_admin().await;
    let proxy = proxy_manager(tmp.path(), &addr);
    proxy.start().await.unwrap();

    proxy.add_route("app1", "a.example.com", 4001).await.unwrap();
    proxy.add_route("app2", "b.example.com", 4002).await.unwrap();
    proxy.remove_route("app1").await.unwrap();

    let loads = admin.loads();
    assert_eq!(loads.len(), 3);
    assert_eq!(hosts(&loads[1]), vec!["a.example.com", "b.example.com"]);

    let last = loads.last().unwrap();
    assert_eq!(hosts(last), vec!["b.example.com"]);
    assert_eq!(
        last["apps"]["http"]["servers"]["main"]["routes"][0]["handle"][0]["upstreams"][0]["dial"],
        "localhost:4002"
    );

    // the file on disk matches what was posted
    let written: Value = proxy.config_file().read_json().await.unwrap();
    assert_eq!(&written, last);
}

#[tokio::test]
async fn test_proxy_reload_failure_keeps_desired_route() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, admin) = spawn_admin().await;
    let proxy = proxy_manager(tmp.path(), &addr);

    admin.fail.store(true, Ordering::SeqCst);
    let err = proxy.add_route("app1", "a.example.com", 4001).await.unwrap_err();
    assert!(matches!(err.root(), shipyard::errors::PlatformError::ExternalTool { .. }));
    assert!(proxy.routes().await.contains_key("app1"));

    // the next successful change carries the route along
    admin.fail.store(false, Ordering::SeqCst);
    proxy.add_route("app2", "b.example.com", 4002).await.unwrap();
    assert_eq!(hosts(&admin.loads()[0]), vec!["a.example.com", "b.example.com"]);
}

#[tokio::test]
async fn test_proxy_remove_unknown_route_is_silent() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, admin) = spawn_admin().await;
    let proxy = proxy_manager(tmp.path(), &addr);

    proxy.remove_route("ghost").await.unwrap();
    assert!(admin.loads().is_empty());
    assert!(proxy.routes().await.is_empty());
}

#[tokio::test]
async fn test_proxy_attach_fails_without_admin_endpoint() {
    let tmp = tempfile::tempdir().unwrap();
    // bind and drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let proxy = proxy_manager(tmp.path(), &addr);
    assert!(proxy.start().await.is_err());
    // the initial config is written regardless
    assert!(proxy.config_file().exists().await);
}

fn backup_manager(dir: &Path) -> BackupManager {
    BackupManager::new(
        backup::Options {
            enabled: false,
            destination: "backups/".to_string(),
            s3_bucket: "shipyard-backups".to_string(),
            s3_region: "eu-west-1".to_string(),
            config_file: dir.join("litestream.yml"),
            ..Default::default()
        },
        Arc::new(EventBus::default()),
    )
}

async fn read_yaml(manager: &BackupManager) -> serde_yaml::Value {
    let text = manager.config_file().read_string().await.unwrap();
    serde_yaml::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_backup_config_tracks_databases() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = backup_manager(tmp.path());
    manager.start().await.unwrap();

    let db1 = tmp.path().join("data/app1/db/app.db");
    let db2 = tmp.path().join("data/app2/db/app.db");
    manager.add_database("app1", &db1).await.unwrap();
    manager.add_database("app2", &db2).await.unwrap();

    let config = read_yaml(&manager).await;
    let dbs = config["dbs"].as_sequence().unwrap();
    assert_eq!(dbs.len(), 2);
    assert_eq!(dbs[0]["path"].as_str().unwrap(), db1.display().to_string());
    let replica = &dbs[0]["replicas"][0];
    assert_eq!(replica["type"].as_str().unwrap(), "s3");
    assert_eq!(replica["bucket"].as_str().unwrap(), "shipyard-backups");
    assert_eq!(replica["path"].as_str().unwrap(), "backups/app1");
    assert_eq!(replica["sync-interval"].as_str().unwrap(), "10s");
    assert!(replica.get("secret-access-key").is_none());

    manager.remove_database("app1").await.unwrap();
    let config = read_yaml(&manager).await;
    let dbs = config["dbs"].as_sequence().unwrap();
    assert_eq!(dbs.len(), 1);
    assert_eq!(dbs[0]["replicas"][0]["path"].as_str().unwrap(), "backups/app2");

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_backup_config_ignores_registration_order() {
    let tmp = tempfile::tempdir().unwrap();
    let first = backup_manager(&tmp.path().join("first"));
    let second = backup_manager(&tmp.path().join("second"));
    std::fs::create_dir_all(tmp.path().join("first")).unwrap();
    std::fs::create_dir_all(tmp.path().join("second")).unwrap();

    let db1 = tmp.path().join("app1.db");
    let db2 = tmp.path().join("app2.db");
    let db3 = tmp.path().join("app3.db");

    first.add_database("app1", &db1).await.unwrap();
    first.add_database("app2", &db2).await.unwrap();
    first.add_database("app3", &db3).await.unwrap();
    first.remove_database("app2").await.unwrap();

    second.add_database("app3", &db3).await.unwrap();
    second.add_database("app1", &db1).await.unwrap();

    assert_eq!(
        first.config_file().read_bytes().await.unwrap(),
        second.config_file().read_bytes().await.unwrap()
    );
}

fn starts(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_backup_daemon_restarts_on_every_change() {
    let tmp = tempfile::tempdir().unwrap();
    let starts_file = tmp.path().join("starts");
    // stands in for litestream: records each start, then idles
    let binary = write_script(
        tmp.path(),
        "litestream",
        &format!("echo \"$$ $*\" >> {}\nexec sleep 30", starts_file.display()),
    );
    let manager = BackupManager::new(
        backup::Options {
            enabled: true,
            binary: binary.display().to_string(),
            s3_bucket: "shipyard-backups".to_string(),
            config_file: tmp.path().join("litestream.yml"),
            stop_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        Arc::new(EventBus::default()),
    );

    manager.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || async { starts(&starts_file).len() == 1 }).await);
    let first = starts(&starts_file);
    assert!(first[0].ends_with(&format!("replicate -config {}", tmp.path().join("litestream.yml").display())));

    manager.add_database("app1", &tmp.path().join("app1.db")).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || async { starts(&starts_file).len() == 2 }).await);

    manager.remove_database("app1").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || async { starts(&starts_file).len() == 3 }).await);

    // each start is a fresh process
    let pids: Vec<String> = starts(&starts_file)
        .iter()
        .map(|line| line.split(' ').next().unwrap().to_string())
        .collect();
    assert_ne!(pids[0], pids[1]);
    assert_ne!(pids[1], pids[2]);

    // unknown removals change nothing and do not restart
    manager.remove_database("ghost").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(starts(&starts_file).len(), 3);

    manager.stop().await.unwrap();
}
