//! Shared fixtures: executable scripts, polling and recording collaborators

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use shipyard::deploy::deployer::{AppDeployer, BackupClient, DeployOutcome, ProxyClient, SupervisorClient};
use shipyard::deploy::fsm::ProcessStatus;
use shipyard::deploy::{AppBuilder, AppKind, BuildResult, SourceFetcher};
use shipyard::errors::PlatformError;
use shipyard::supervisor::Env;

/// Write an executable `/bin/sh` script
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll `check` until it holds or `limit` elapses
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Fetcher that records requests and returns a fixed directory
pub struct MockFetcher {
    pub dir: PathBuf,
    pub fail: bool,
    pub calls: Mutex<Vec<(String, String, String)>>,
}

impl MockFetcher {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    async fn fetch_source(&self, repo_url: &str, branch: &str, commit: &str) -> Result<PathBuf, PlatformError> {
        self.calls
            .lock()
            .await
            .push((repo_url.to_string(), branch.to_string(), commit.to_string()));
        if self.fail {
            return Err(PlatformError::external("git", "exit status: 128", "fatal: repository not found"));
        }
        Ok(self.dir.clone())
    }

    async fn cleanup_source(&self, _path: &Path) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Builder returning a prepared binary, or failing like a compiler would
pub struct MockBuilder {
    pub binary: PathBuf,
    pub default_port: Option<u16>,
    pub uses_database: bool,
    pub fail: bool,
    pub delay: Duration,
}

impl MockBuilder {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            default_port: None,
            uses_database: false,
            fail: false,
            delay: Duration::ZERO,
        }
    }

    pub fn result(&self) -> BuildResult {
        BuildResult {
            kind: AppKind::Go,
            binary_path: self.binary.clone(),
            default_port: self.default_port,
            uses_database: self.uses_database,
            static_dir: None,
        }
    }
}

#[async_trait]
impl AppBuilder for MockBuilder {
    async fn detect_and_build(&self, _source_dir: &Path, _build_id: &str) -> Result<BuildResult, PlatformError> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(PlatformError::external("go build", "exit status: 1", "main.go:3: undefined: x"));
        }
        Ok(self.result())
    }
}

/// Deployer that records which apps it deployed
#[derive(Default)]
pub struct MockDeployer {
    pub deployed: Mutex<Vec<String>>,
    pub undeployed: Mutex<Vec<String>>,
}

#[async_trait]
impl AppDeployer for MockDeployer {
    async fn deploy(&self, app_id: &str, _build: &BuildResult) -> Result<DeployOutcome, PlatformError> {
        self.deployed.lock().await.push(app_id.to_string());
        Ok(DeployOutcome {
            port: 4000,
            exec_path: PathBuf::from("/bin/true"),
            database_path: None,
        })
    }

    async fn undeploy(&self, app_id: &str) -> Result<(), PlatformError> {
        self.undeployed.lock().await.push(app_id.to_string());
        Ok(())
    }
}

/// Supervisor stand-in tracking calls and a running flag per app
#[derive(Default)]
pub struct MockSupervisor {
    pub calls: Mutex<Vec<String>>,
    pub running: Mutex<Vec<String>>,
    pub started_env: Mutex<Option<Env>>,
    pub fail_start: bool,
}

#[async_trait]
impl SupervisorClient for MockSupervisor {
    async fn start_app(&self, app_id: &str, _exec_path: &Path, env: &Env) -> Result<(), PlatformError> {
        self.calls.lock().await.push(format!("start {app_id}"));
        if self.fail_start {
            return Err(PlatformError::Internal("exec format error".to_string()));
        }
        *self.started_env.lock().await = Some(env.clone());
        self.running.lock().await.push(app_id.to_string());
        Ok(())
    }

    async fn stop_app(&self, app_id: &str) -> Result<(), PlatformError> {
        self.calls.lock().await.push(format!("stop {app_id}"));
        let mut running = self.running.lock().await;
        match running.iter().position(|id| id == app_id) {
            Some(index) => {
                running.remove(index);
                Ok(())
            }
            None => Err(PlatformError::NotFound(format!("app {app_id}"))),
        }
    }

    async fn restart_app(&self, app_id: &str) -> Result<(), PlatformError> {
        self.calls.lock().await.push(format!("restart {app_id}"));
        Ok(())
    }

    async fn status(&self, app_id: &str) -> Result<ProcessStatus, PlatformError> {
        if self.running.lock().await.iter().any(|id| id == app_id) {
            Ok(ProcessStatus::Running)
        } else {
            Err(PlatformError::NotFound(format!("app {app_id}")))
        }
    }
}

/// Proxy and backup stand-in recording every call in order
#[derive(Default)]
pub struct MockRegistry {
    pub calls: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl ProxyClient for MockRegistry {
    async fn add_route(&self, app_id: &str, domain: &str, port: u16) -> Result<(), PlatformError> {
        self.calls.lock().await.push(format!("add_route {app_id} {domain} {port}"));
        if self.fail {
            return Err(PlatformError::external("caddy reload", "status 500", ""));
        }
        Ok(())
    }

    async fn remove_route(&self, app_id: &str) -> Result<(), PlatformError> {
        self.calls.lock().await.push(format!("remove_route {app_id}"));
        if self.fail {
            return Err(PlatformError::external("caddy reload", "status 500", ""));
        }
        Ok(())
    }
}

#[async_trait]
impl BackupClient for MockRegistry {
    async fn add_database(&self, app_id: &str, db_path: &Path) -> Result<(), PlatformError> {
        self.calls
            .lock()
            .await
            .push(format!("add_database {app_id} {}", db_path.display()));
        if self.fail {
            return Err(PlatformError::external("litestream", "exit status: 1", ""));
        }
        Ok(())
    }

    async fn remove_database(&self, app_id: &str) -> Result<(), PlatformError> {
        self.calls.lock().await.push(format!("remove_database {app_id}"));
        if self.fail {
            return Err(PlatformError::external("litestream", "exit status: 1", ""));
        }
        Ok(())
    }
}
