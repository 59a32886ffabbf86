//! Deployer: installs a built binary and wires it into the supervisor,
//! reverse proxy and replication daemon

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::deploy::fsm::ProcessStatus;
use crate::deploy::BuildResult;
use crate::errors::{PlatformError, ResultExt};
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::reconcile::{BackupManager, ProxyManager};
use crate::store::RecordStore;
use crate::supervisor::{Env, Supervisor};

/// Process control consumed by the deployer
#[async_trait]
pub trait SupervisorClient: Send + Sync {
    async fn start_app(&self, app_id: &str, exec_path: &Path, env: &Env) -> Result<(), PlatformError>;

    async fn stop_app(&self, app_id: &str) -> Result<(), PlatformError>;

    async fn restart_app(&self, app_id: &str) -> Result<(), PlatformError>;

    async fn status(&self, app_id: &str) -> Result<ProcessStatus, PlatformError>;
}

/// Route table consumed by the deployer
#[async_trait]
pub trait ProxyClient: Send + Sync {
    async fn add_route(&self, app_id: &str, domain: &str, port: u16) -> Result<(), PlatformError>;

    async fn remove_route(&self, app_id: &str) -> Result<(), PlatformError>;
}

/// Database replication registry consumed by the deployer
#[async_trait]
pub trait BackupClient: Send + Sync {
    async fn add_database(&self, app_id: &str, db_path: &Path) -> Result<(), PlatformError>;

    async fn remove_database(&self, app_id: &str) -> Result<(), PlatformError>;
}

/// Final step of the pipeline
#[async_trait]
pub trait AppDeployer: Send + Sync {
    async fn deploy(&self, app_id: &str, build: &BuildResult) -> Result<DeployOutcome, PlatformError>;

    /// Tear an app down; individual step failures are logged, not returned
    async fn undeploy(&self, app_id: &str) -> Result<(), PlatformError>;
}

/// What a deploy put in place
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub port: u16,
    pub exec_path: PathBuf,
    pub database_path: Option<PathBuf>,
}

// Process spawn and kill sequencing is not cancellation-aware: run it
// detached so a pipeline timeout can not drop it halfway.
#[async_trait]
impl SupervisorClient for Supervisor {
    async fn start_app(&self, app_id: &str, exec_path: &Path, env: &Env) -> Result<(), PlatformError> {
        let supervisor = self.clone();
        let (app_id, exec_path, env) = (app_id.to_string(), exec_path.to_path_buf(), env.clone());
        tokio::spawn(async move { Supervisor::start_app(&supervisor, &app_id, &exec_path, &env).await })
            .await
            .map_err(|e| PlatformError::Internal(format!("start task failed: {e}")))?
    }

    async fn stop_app(&self, app_id: &str) -> Result<(), PlatformError> {
        let supervisor = self.clone();
        let app_id = app_id.to_string();
        tokio::spawn(async move { Supervisor::stop_app(&supervisor, &app_id).await })
            .await
            .map_err(|e| PlatformError::Internal(format!("stop task failed: {e}")))?
    }

    async fn restart_app(&self, app_id: &str) -> Result<(), PlatformError> {
        let supervisor = self.clone();
        let app_id = app_id.to_string();
        tokio::spawn(async move { Supervisor::restart_app(&supervisor, &app_id).await })
            .await
            .map_err(|e| PlatformError::Internal(format!("restart task failed: {e}")))?
    }

    async fn status(&self, app_id: &str) -> Result<ProcessStatus, PlatformError> {
        Supervisor::status(self, app_id).await
    }
}

#[async_trait]
impl ProxyClient for ProxyManager {
    async fn add_route(&self, app_id: &str, domain: &str, port: u16) -> Result<(), PlatformError> {
        ProxyManager::add_route(self, app_id, domain, port).await
    }

    async fn remove_route(&self, app_id: &str) -> Result<(), PlatformError> {
        ProxyManager::remove_route(self, app_id).await
    }
}

#[async_trait]
impl BackupClient for BackupManager {
    async fn add_database(&self, app_id: &str, db_path: &Path) -> Result<(), PlatformError> {
        BackupManager::add_database(self, app_id, db_path).await
    }

    async fn remove_database(&self, app_id: &str) -> Result<(), PlatformError> {
        BackupManager::remove_database(self, app_id).await
    }
}

/// Deployer options
#[derive(Debug, Clone)]
pub struct Options {
    /// Parent of every app working directory
    pub apps_dir: PathBuf,

    /// Parent of every app's persistent data (`<data>/<id>/db`)
    pub data_dir: PathBuf,

    pub default_port: u16,

    /// Environment every app receives, lowest precedence
    pub default_env: BTreeMap<String, String>,

    /// Register SQLite databases for replication
    pub backup_databases: bool,

    pub deploy_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            apps_dir: PathBuf::from("apps"),
            data_dir: PathBuf::from("app-data"),
            default_port: 8080,
            default_env: BTreeMap::new(),
            backup_databases: true,
            deploy_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Default [`AppDeployer`]
pub struct Deployer {
    options: Options,
    store: Arc<dyn RecordStore>,
    supervisor: Arc<dyn SupervisorClient>,
    proxy: Arc<dyn ProxyClient>,
    backup: Option<Arc<dyn BackupClient>>,
}

impl Deployer {
    pub fn new(
        options: Options,
        store: Arc<dyn RecordStore>,
        supervisor: Arc<dyn SupervisorClient>,
        proxy: Arc<dyn ProxyClient>,
        backup: Option<Arc<dyn BackupClient>>,
    ) -> Self {
        Self {
            options,
            store,
            supervisor,
            proxy,
            backup,
        }
    }

    fn app_dir(&self, app_id: &str) -> Result<Dir, PlatformError> {
        Ok(Dir::new(std::path::absolute(self.options.apps_dir.join(app_id))?))
    }

    fn database_file(&self, app_id: &str) -> Result<File, PlatformError> {
        let path = self.options.data_dir.join(app_id).join("db").join("app.db");
        Ok(File::new(std::path::absolute(path)?))
    }

    async fn install(&self, app_id: &str, build: &BuildResult) -> Result<DeployOutcome, PlatformError> {
        let app = self.store.get_app(app_id).await?;

        // A running process would make the start below conflict
        if let Ok(ProcessStatus::Running) = self.supervisor.status(app_id).await {
            info!(app_id, "Stopping running instance before redeploy");
            self.supervisor
                .stop_app(app_id)
                .await
                .context("failed to stop running instance")?;
        }

        let app_dir = self.app_dir(app_id)?;
        app_dir.subdir("bin").create().await?;

        let exec = app_dir.subdir("bin").file("app");
        File::new(&build.binary_path)
            .copy_to(&exec)
            .await
            .context("failed to install binary")?;
        exec.set_executable().await?;

        if let Some(static_dir) = &build.static_dir {
            if let Err(e) = Dir::new(static_dir).copy_to(&app_dir.subdir("static")).await {
                warn!(app_id, error = %e, "Failed to copy static assets");
            }
        }

        let port = app.port.or(build.default_port).unwrap_or(self.options.default_port);

        let mut env: Env = self.options.default_env.clone();
        env.insert("PORT".to_string(), port.to_string());
        for var in &app.environment {
            env.insert(var.key.clone(), var.value.clone());
        }
        env.insert("HOME".to_string(), app_dir.path().display().to_string());

        let mut database_path = None;
        if build.uses_database {
            let db = self.database_file(app_id)?;
            if let Some(parent) = db.path().parent() {
                Dir::new(parent).create().await?;
            }
            env.insert("DATABASE_URL".to_string(), format!("sqlite://{}", db.path().display()));

            if self.options.backup_databases {
                if let Some(backup) = &self.backup {
                    if let Err(e) = backup.add_database(app_id, db.path()).await {
                        warn!(app_id, error = %e, "Failed to register database for backup");
                    }
                }
            }
            database_path = Some(db.path().to_path_buf());
        }

        let routed = !app.domain.is_empty();
        if routed {
            self.proxy
                .add_route(app_id, &app.domain, port)
                .await
                .context("failed to configure proxy")?;
        } else {
            warn!(app_id, "App has no domain, skipping proxy route");
        }

        if let Err(e) = self.supervisor.start_app(app_id, exec.path(), &env).await {
            if routed {
                if let Err(cleanup) = self.proxy.remove_route(app_id).await {
                    warn!(app_id, error = %cleanup, "Failed to remove route after failed start");
                }
            }
            return Err(e.wrap("failed to start app"));
        }

        info!(app_id, port, "App deployed");
        Ok(DeployOutcome {
            port,
            exec_path: exec.path().to_path_buf(),
            database_path,
        })
    }
}

#[async_trait]
impl AppDeployer for Deployer {
    async fn deploy(&self, app_id: &str, build: &BuildResult) -> Result<DeployOutcome, PlatformError> {
        debug!(app_id, binary = %build.binary_path.display(), "Deploying build");
        match tokio::time::timeout(self.options.deploy_timeout, self.install(app_id, build)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(format!(
                "deploy of app {app_id} exceeded {:?}",
                self.options.deploy_timeout
            ))),
        }
    }

    async fn undeploy(&self, app_id: &str) -> Result<(), PlatformError> {
        match self.supervisor.stop_app(app_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(app_id, "App has no process"),
            Err(e) => warn!(app_id, error = %e, "Failed to stop app"),
        }

        if let Err(e) = self.proxy.remove_route(app_id).await {
            warn!(app_id, error = %e, "Failed to remove route");
        }

        if let Some(backup) = &self.backup {
            if let Err(e) = backup.remove_database(app_id).await {
                warn!(app_id, error = %e, "Failed to remove backup registration");
            }
        }

        match self.app_dir(app_id) {
            Ok(dir) => {
                if let Err(e) = dir.delete().await {
                    warn!(app_id, error = %e, "Failed to delete app directory");
                }
            }
            Err(e) => warn!(app_id, error = %e, "Failed to resolve app directory"),
        }

        info!(app_id, "App undeployed");
        Ok(())
    }
}
