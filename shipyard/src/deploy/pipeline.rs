//! Deployment pipeline: fetch, build and deploy an application

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::deploy::deployer::{AppDeployer, DeployOutcome};
use crate::deploy::fsm::{AppStatus, DeploymentStatus};
use crate::deploy::webhook::PushEvent;
use crate::deploy::{AppBuilder, BuildResult, SourceFetcher};
use crate::errors::{PlatformError, ResultExt};
use crate::events::{Event, EventBus, EventType};
use crate::models::app::Application;
use crate::models::deployment::Deployment;
use crate::store::RecordStore;

/// Pipeline options
#[derive(Debug, Clone)]
pub struct Options {
    /// Outer bound for one deploy, measured once it holds the app lock
    pub timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Orchestrates deploys and undeploys.
///
/// At most one deploy or undeploy runs per application at a time; a
/// deployment waiting for its turn stays `pending`.
pub struct Pipeline {
    options: Options,
    store: Arc<dyn RecordStore>,
    bus: Arc<EventBus>,
    fetcher: Arc<dyn SourceFetcher>,
    builder: Arc<dyn AppBuilder>,
    deployer: Arc<dyn AppDeployer>,
    app_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        options: Options,
        store: Arc<dyn RecordStore>,
        bus: Arc<EventBus>,
        fetcher: Arc<dyn SourceFetcher>,
        builder: Arc<dyn AppBuilder>,
        deployer: Arc<dyn AppDeployer>,
    ) -> Self {
        Self {
            options,
            store,
            bus,
            fetcher,
            builder,
            deployer,
            app_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Deploy `app_id` at `commit` (branch head when empty) and wait for
    /// the outcome
    pub async fn deploy_app(&self, app_id: &str, commit: &str) -> Result<Deployment, PlatformError> {
        let deployment = self.create_deployment(app_id, commit).await?;
        self.execute(deployment).await
    }

    /// Record a pending deployment and run it in the background
    pub async fn enqueue_deploy(self: &Arc<Self>, app_id: &str, commit: &str) -> Result<Deployment, PlatformError> {
        let deployment = self.create_deployment(app_id, commit).await?;
        let queued = deployment.clone();

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let app_id = deployment.app_id.clone();
            let deployment_id = deployment.id.clone();
            if let Err(e) = pipeline.execute(deployment).await {
                error!(app_id = %app_id, deployment_id = %deployment_id, error = %e, "Background deployment failed");
            }
        });

        Ok(queued)
    }

    /// Stop and remove an app. An app missing from the store is treated as
    /// already gone.
    pub async fn undeploy_app(&self, app_id: &str) -> Result<(), PlatformError> {
        self.with_app_lock(app_id, self.undeploy_locked(app_id)).await
    }

    async fn undeploy_locked(&self, app_id: &str) -> Result<(), PlatformError> {
        let app = match self.store.get_app(app_id).await {
            Ok(app) => Some(app),
            Err(e) if e.is_not_found() => {
                warn!(app_id = %app_id, "App not found in store, undeploying anyway");
                None
            }
            Err(e) => return Err(e.wrap("failed to get app details")),
        };
        let name = app.as_ref().map_or(app_id, |a| a.name.as_str()).to_string();

        info!(app_id = %app_id, "Starting undeployment");
        self.bus.publish(Event::new(
            EventType::UndeployStarted,
            app_id,
            format!("Starting undeployment of app {name}"),
        ));

        let undeploy = tokio::time::timeout(self.options.timeout, self.deployer.undeploy(app_id));
        let result = match undeploy.await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(format!(
                "undeploy of app {app_id} exceeded {:?}",
                self.options.timeout
            ))),
        };
        if let Err(e) = result {
            self.bus.publish(
                Event::new(EventType::AppFailed, app_id, format!("Undeployment of app {name} failed"))
                    .with_data("error", e.to_string()),
            );
            return Err(e.wrap("undeployment failed"));
        }

        self.bus.publish(Event::new(
            EventType::AppUndeployed,
            app_id,
            format!("Successfully undeployed app {name}"),
        ));

        if let Some(mut app) = app {
            app.status = AppStatus::Undeployed;
            self.store
                .update_app(&app)
                .await
                .context("failed to mark app undeployed")?;
        }

        info!(app_id = %app_id, "Undeployment completed");
        Ok(())
    }

    /// Deploy every app tracking the pushed repository and branch.
    ///
    /// Returns the number of deploys dispatched without waiting for them.
    pub async fn process_webhook(self: &Arc<Self>, push: &PushEvent) -> Result<usize, PlatformError> {
        info!(repo_url = %push.repo_url, branch = %push.branch, commit = %push.commit, "Processing push event");

        let apps = self.store.list_apps().await.context("failed to list apps")?;
        let mut dispatched = 0;
        for app in apps.iter().filter(|a| push.matches(&a.repo_url, &a.branch)) {
            match self.enqueue_deploy(&app.id, &push.commit).await {
                Ok(deployment) => {
                    info!(app_id = %app.id, deployment_id = %deployment.id, "Webhook deployment queued");
                    dispatched += 1;
                }
                Err(e) => warn!(app_id = %app.id, error = %e, "Failed to queue webhook deployment"),
            }
        }

        info!(matching_apps = dispatched, "Webhook processing completed");
        Ok(dispatched)
    }

    /// Number of apps with a live per-app lock entry
    pub async fn tracked_locks(&self) -> usize {
        self.app_locks.lock().await.len()
    }

    /// Run `work` under the app's lock; the entry is dropped once no one else holds it
    async fn with_app_lock<T>(&self, app_id: &str, work: impl Future<Output = T>) -> T {
        let lock = {
            let mut locks = self.app_locks.lock().await;
            Arc::clone(locks.entry(app_id.to_string()).or_default())
        };

        let result = {
            let _guard = lock.lock().await;
            work.await
        };

        let mut locks = self.app_locks.lock().await;
        // the map and this call are the only holders
        if Arc::strong_count(&lock) == 2 {
            locks.remove(app_id);
        }
        result
    }

    async fn create_deployment(&self, app_id: &str, commit: &str) -> Result<Deployment, PlatformError> {
        let app = self.store.get_app(app_id).await.context("failed to get app details")?;

        let deployment = Deployment::new(app_id, commit);
        self.store
            .create_deployment(&deployment)
            .await
            .context("failed to create deployment record")?;

        info!(app_id = %app_id, deployment_id = %deployment.id, commit, "Deployment created");
        self.bus.publish(
            Event::new(
                EventType::DeployStarted,
                app_id,
                format!("Starting deployment of app {}", app.name),
            )
            .with_data("deployment_id", deployment.id.as_str())
            .with_data("commit", commit),
        );
        Ok(deployment)
    }

    async fn execute(&self, deployment: Deployment) -> Result<Deployment, PlatformError> {
        let app_id = deployment.app_id.clone();
        self.with_app_lock(&app_id, self.execute_locked(deployment)).await
    }

    async fn execute_locked(&self, mut deployment: Deployment) -> Result<Deployment, PlatformError> {
        let app_id = deployment.app_id.clone();
        let deadline = Instant::now() + self.options.timeout;

        deployment.transition(DeploymentStatus::InProgress)?;
        if let Err(e) = self.store.update_deployment(&deployment).await {
            warn!(app_id = %app_id, deployment_id = %deployment.id, error = %e, "Failed to update deployment record");
        }

        let result = match tokio::time::timeout_at(deadline, self.run_steps(&app_id, &deployment.commit)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(format!(
                "deployment exceeded {:?}",
                self.options.timeout
            ))),
        };

        match result {
            Ok((build, outcome)) => {
                self.succeed(&mut deployment, &build, &outcome).await?;
                Ok(deployment)
            }
            Err(e) => {
                error!(app_id = %app_id, deployment_id = %deployment.id, error = %e, "Deployment failed");
                deployment.finish(DeploymentStatus::Failed, e.to_string())?;
                if let Err(update) = self.store.update_deployment(&deployment).await {
                    warn!(app_id = %app_id, deployment_id = %deployment.id, error = %update, "Failed to update deployment record");
                }

                self.bus.publish(
                    Event::new(EventType::DeployFailed, &app_id, format!("Deployment of app {app_id} failed"))
                        .with_data("deployment_id", deployment.id.as_str())
                        .with_data("error", e.to_string()),
                );
                Err(e.wrap("deployment failed"))
            }
        }
    }

    async fn run_steps(&self, app_id: &str, commit: &str) -> Result<(BuildResult, DeployOutcome), PlatformError> {
        let app: Application = self.store.get_app(app_id).await.context("failed to get app details")?;

        info!(app_id = %app_id, repo_url = %app.repo_url, branch = %app.branch, "Fetching source");
        let source_dir = self
            .fetcher
            .fetch_source(&app.repo_url, &app.branch, commit)
            .await
            .context("source fetching failed")?;

        info!(app_id = %app_id, source = %source_dir.display(), "Building application");
        let build = self
            .builder
            .detect_and_build(&source_dir, app_id)
            .await
            .context("build failed")?;

        info!(app_id = %app_id, kind = %build.kind, "Deploying application");
        let outcome = self.deployer.deploy(app_id, &build).await.context("deploy failed")?;
        Ok((build, outcome))
    }

    async fn succeed(
        &self,
        deployment: &mut Deployment,
        build: &BuildResult,
        outcome: &DeployOutcome,
    ) -> Result<(), PlatformError> {
        let app_id = deployment.app_id.clone();
        deployment.finish(
            DeploymentStatus::Success,
            format!("Deployed {} build on port {}", build.kind, outcome.port),
        )?;

        // The app is already running; record failures from here on are logged only
        if let Err(e) = self.store.update_deployment(deployment).await {
            warn!(app_id = %app_id, deployment_id = %deployment.id, error = %e, "Failed to update deployment record");
        }

        match self.store.get_app(&app_id).await {
            Ok(mut app) => {
                app.status = AppStatus::Running;
                app.last_deploy = deployment.ended_at.or_else(|| Some(Utc::now()));
                if let Err(e) = self.store.update_app(&app).await {
                    warn!(app_id = %app_id, error = %e, "Failed to update app status");
                }
            }
            Err(e) => warn!(app_id = %app_id, error = %e, "Failed to load app after deploy"),
        }

        self.bus.publish(
            Event::new(EventType::AppDeployed, &app_id, format!("Successfully deployed app {app_id}"))
                .with_data("deployment_id", deployment.id.as_str())
                .with_data("commit", deployment.commit.as_str())
                .with_data("port", outcome.port),
        );
        info!(app_id = %app_id, deployment_id = %deployment.id, port = outcome.port, "Deployment completed");
        Ok(())
    }
}
