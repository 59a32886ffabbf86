//! JSON-file backed record store

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::deploy::fsm::AppStatus;
use crate::errors::PlatformError;
use crate::filesys::file::File;
use crate::models::app::{Application, NewApplication};
use crate::models::backup::Backup;
use crate::models::deployment::Deployment;
use crate::store::RecordStore;
use crate::utils::generate_uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Records {
    #[serde(default)]
    apps: BTreeMap<String, Application>,
    #[serde(default)]
    deployments: BTreeMap<String, Deployment>,
    #[serde(default)]
    backups: BTreeMap<String, Backup>,
}

/// Record store keeping every record in memory and writing the full set
/// to a JSON file after each mutation.
///
/// Reads share a reader/writer lock; mutations are funnelled through a
/// single writer so the file always reflects a complete record set.
pub struct JsonRecordStore {
    records: RwLock<Records>,
    writer: Mutex<()>,
    file: Option<File>,
}

impl JsonRecordStore {
    /// Open (or create) a store persisted at `file`
    pub async fn open(file: File) -> Result<Self, PlatformError> {
        let records = if file.exists().await {
            let records: Records = file.read_json().await?;
            info!(
                apps = records.apps.len(),
                deployments = records.deployments.len(),
                "Loaded record store from {}",
                file.path().display()
            );
            records
        } else {
            Records::default()
        };

        Ok(Self {
            records: RwLock::new(records),
            writer: Mutex::new(()),
            file: Some(file),
        })
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Records::default()),
            writer: Mutex::new(()),
            file: None,
        }
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T, PlatformError>
    where
        F: FnOnce(&mut Records) -> Result<T, PlatformError>,
    {
        let _writer = self.writer.lock().await;

        let mut next = self.records.read().await.clone();
        let out = f(&mut next)?;

        if let Some(file) = &self.file {
            file.write_json(&next).await?;
            debug!("Persisted record store to {}", file.path().display());
        }

        *self.records.write().await = next;
        Ok(out)
    }
}

fn validate_new_app(new_app: &NewApplication) -> Result<(), PlatformError> {
    if new_app.name.trim().is_empty() {
        return Err(PlatformError::ValidationError("name is required".to_string()));
    }
    if new_app.repo_url.trim().is_empty() {
        return Err(PlatformError::ValidationError("repo_url is required".to_string()));
    }
    if let Some(branch) = &new_app.branch {
        if branch.trim().is_empty() {
            return Err(PlatformError::ValidationError("branch must not be empty".to_string()));
        }
    }
    Ok(())
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn create_app(&self, new_app: NewApplication) -> Result<Application, PlatformError> {
        validate_new_app(&new_app)?;

        let now = Utc::now();
        let app = Application {
            id: generate_uuid(),
            name: new_app.name.trim().to_string(),
            repo_url: new_app.repo_url.trim().to_string(),
            branch: new_app.branch.unwrap_or_else(|| "main".to_string()),
            domain: new_app.domain,
            port: new_app.port,
            environment: new_app.environment,
            status: AppStatus::Pending,
            last_deploy: None,
            created_at: now,
            updated_at: now,
        };

        let created = app.clone();
        self.mutate(move |records| {
            records.apps.insert(app.id.clone(), app);
            Ok(())
        })
        .await?;

        Ok(created)
    }

    async fn get_app(&self, id: &str) -> Result<Application, PlatformError> {
        self.records
            .read()
            .await
            .apps
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("application {id}")))
    }

    async fn list_apps(&self) -> Result<Vec<Application>, PlatformError> {
        let mut apps: Vec<Application> = self.records.read().await.apps.values().cloned().collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(apps)
    }

    async fn update_app(&self, app: &Application) -> Result<(), PlatformError> {
        let mut app = app.clone();
        app.updated_at = Utc::now();
        self.mutate(move |records| match records.apps.get_mut(&app.id) {
            Some(existing) => {
                *existing = app;
                Ok(())
            }
            None => Err(PlatformError::NotFound(format!("application {}", app.id))),
        })
        .await
    }

    async fn delete_app(&self, id: &str) -> Result<(), PlatformError> {
        self.mutate(|records| {
            if records.apps.remove(id).is_none() {
                return Err(PlatformError::NotFound(format!("application {id}")));
            }
            records.deployments.retain(|_, d| d.app_id != id);
            records.backups.retain(|_, b| b.app_id != id);
            Ok(())
        })
        .await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), PlatformError> {
        let deployment = deployment.clone();
        self.mutate(move |records| {
            if records.deployments.contains_key(&deployment.id) {
                return Err(PlatformError::Conflict(format!(
                    "deployment {} already exists",
                    deployment.id
                )));
            }
            records.deployments.insert(deployment.id.clone(), deployment);
            Ok(())
        })
        .await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), PlatformError> {
        let deployment = deployment.clone();
        self.mutate(move |records| {
            let existing = records
                .deployments
                .get_mut(&deployment.id)
                .ok_or_else(|| PlatformError::NotFound(format!("deployment {}", deployment.id)))?;

            if existing.status.is_terminal() && existing.status != deployment.status {
                return Err(PlatformError::Conflict(format!(
                    "deployment {} already finished as {}",
                    deployment.id,
                    existing.status.as_str()
                )));
            }

            *existing = deployment;
            Ok(())
        })
        .await
    }

    async fn get_deployment(&self, id: &str) -> Result<Deployment, PlatformError> {
        self.records
            .read()
            .await
            .deployments
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("deployment {id}")))
    }

    async fn list_deployments(&self, app_id: &str) -> Result<Vec<Deployment>, PlatformError> {
        let mut deployments: Vec<Deployment> = self
            .records
            .read()
            .await
            .deployments
            .values()
            .filter(|d| d.app_id == app_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(deployments)
    }

    async fn create_backup(&self, backup: &Backup) -> Result<(), PlatformError> {
        let backup = backup.clone();
        self.mutate(move |records| {
            records.backups.insert(backup.id.clone(), backup);
            Ok(())
        })
        .await
    }

    async fn list_backups(&self, app_id: &str) -> Result<Vec<Backup>, PlatformError> {
        let mut backups: Vec<Backup> = self
            .records
            .read()
            .await
            .backups
            .values()
            .filter(|b| b.app_id == app_id)
            .cloned()
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }
}
