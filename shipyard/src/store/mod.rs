//! Durable records for applications, deployments and backups

pub mod json;

use async_trait::async_trait;

use crate::errors::PlatformError;
use crate::models::app::{Application, NewApplication};
use crate::models::backup::Backup;
use crate::models::deployment::Deployment;

pub use json::JsonRecordStore;

/// Record store consumed by the pipeline, deployer and API
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Validate and persist a new application
    async fn create_app(&self, new_app: NewApplication) -> Result<Application, PlatformError>;

    async fn get_app(&self, id: &str) -> Result<Application, PlatformError>;

    async fn list_apps(&self) -> Result<Vec<Application>, PlatformError>;

    async fn update_app(&self, app: &Application) -> Result<(), PlatformError>;

    /// Remove an application together with its deployments and backups
    async fn delete_app(&self, id: &str) -> Result<(), PlatformError>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), PlatformError>;

    /// Persist a deployment; a stored terminal status can not be replaced
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), PlatformError>;

    async fn get_deployment(&self, id: &str) -> Result<Deployment, PlatformError>;

    /// Deployments of an application, newest first
    async fn list_deployments(&self, app_id: &str) -> Result<Vec<Deployment>, PlatformError>;

    async fn create_backup(&self, backup: &Backup) -> Result<(), PlatformError>;

    async fn list_backups(&self, app_id: &str) -> Result<Vec<Backup>, PlatformError>;
}
