//! Continuous SQLite replication (Litestream).
//!
//! Registered databases are rendered into a Litestream YAML config. The
//! daemon has no live reload, so every change restarts it; replication
//! pauses briefly each time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Serialize;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::errors::{PlatformError, ResultExt};
use crate::events::{Event, EventBus, EventType};
use crate::filesys::file::File;
use crate::models::backup::{Backup, BackupStatus};
use crate::reconcile::service::ManagedService;
use crate::reconcile::{ReconcileTarget, Reconciler};
use crate::store::RecordStore;
use crate::utils::{combined_output, generate_uuid};

/// Backup options
#[derive(Debug, Clone)]
pub struct Options {
    /// Run the replication daemon at all
    pub enabled: bool,
    pub binary: String,

    /// Path prefix inside the bucket; each app replicates under `<destination>/<app id>`
    pub destination: String,

    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_endpoint: String,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: Option<Arc<SecretString>>,

    pub sync_interval: String,
    pub retention: String,

    pub config_file: PathBuf,

    /// Output of the daemon
    pub log_file: Option<PathBuf>,

    pub stop_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "litestream".to_string(),
            destination: "backups".to_string(),
            s3_bucket: String::new(),
            s3_region: String::new(),
            s3_endpoint: String::new(),
            s3_access_key_id: String::new(),
            s3_secret_access_key: None,
            sync_interval: "10s".to_string(),
            retention: "24h".to_string(),
            config_file: PathBuf::from("litestream.yml"),
            log_file: None,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

fn is_blank(value: &&str) -> bool {
    value.is_empty()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct LitestreamConfig<'a> {
    #[serde(skip_serializing_if = "is_blank")]
    access_key_id: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    secret_access_key: &'a str,
    dbs: Vec<DbConfig<'a>>,
}

#[derive(Debug, Serialize)]
struct DbConfig<'a> {
    path: String,
    replicas: Vec<ReplicaConfig<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ReplicaConfig<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "is_blank")]
    bucket: &'a str,
    path: String,
    #[serde(skip_serializing_if = "is_blank")]
    region: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    endpoint: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    access_key_id: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    secret_access_key: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    sync_interval: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    retention: &'a str,
}

/// Litestream reconcile target
pub struct LitestreamTarget {
    options: Options,
    config_file: File,
    service: ManagedService,
}

impl LitestreamTarget {
    fn secret(&self) -> &str {
        self.options
            .s3_secret_access_key
            .as_ref()
            .map(|s| s.expose_secret())
            .unwrap_or_default()
    }

    fn replica_path(&self, app_id: &str) -> String {
        let destination = self.options.destination.trim_end_matches('/');
        if destination.is_empty() {
            app_id.to_string()
        } else {
            format!("{destination}/{app_id}")
        }
    }
}

#[async_trait]
impl ReconcileTarget for LitestreamTarget {
    type Spec = PathBuf;

    fn name(&self) -> &'static str {
        "litestream"
    }

    fn config_file(&self) -> &File {
        &self.config_file
    }

    async fn render(&self, entries: &BTreeMap<String, PathBuf>) -> Result<Vec<u8>, PlatformError> {
        let options = &self.options;
        let secret = self.secret();

        let dbs = entries
            .iter()
            .map(|(app_id, db_path)| DbConfig {
                path: db_path.display().to_string(),
                replicas: vec![ReplicaConfig {
                    kind: "s3",
                    bucket: &options.s3_bucket,
                    path: self.replica_path(app_id),
                    region: &options.s3_region,
                    endpoint: &options.s3_endpoint,
                    access_key_id: &options.s3_access_key_id,
                    secret_access_key: secret,
                    sync_interval: &options.sync_interval,
                    retention: &options.retention,
                }],
            })
            .collect();

        let config = LitestreamConfig {
            access_key_id: &options.s3_access_key_id,
            secret_access_key: secret,
            dbs,
        };
        Ok(serde_yaml::to_string(&config)?.into_bytes())
    }

    async fn reload(&self, _config: &[u8]) -> Result<(), PlatformError> {
        if !self.service.is_running().await {
            return Ok(());
        }
        info!("Restarting Litestream to pick up new config");
        self.service.restart().await
    }
}

/// Database replication manager
pub struct BackupManager {
    reconciler: Reconciler<LitestreamTarget>,
    bus: Arc<EventBus>,
    store: Option<Arc<dyn RecordStore>>,
}

impl BackupManager {
    pub fn new(options: Options, bus: Arc<EventBus>) -> Self {
        let mut service = ManagedService::new(
            "litestream",
            options.binary.clone(),
            vec![
                "replicate".to_string(),
                "-config".to_string(),
                options.config_file.display().to_string(),
            ],
        )
        .with_stop_timeout(options.stop_timeout);
        if let Some(path) = &options.log_file {
            service = service.with_log_file(path.clone());
        }

        let target = LitestreamTarget {
            config_file: File::new(&options.config_file),
            options,
            service,
        };

        Self {
            reconciler: Reconciler::new(target),
            bus,
            store: None,
        }
    }

    /// Record restores in `store`
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.reconciler.target().options.enabled
    }

    /// Write the initial config and start the daemon when enabled
    pub async fn start(&self) -> Result<(), PlatformError> {
        self.reconciler.regenerate().await?;
        if !self.is_enabled() {
            info!("Backups disabled, not starting Litestream");
            return Ok(());
        }
        info!("Starting backup manager...");
        self.reconciler.target().service.start().await
    }

    pub async fn stop(&self) -> Result<(), PlatformError> {
        info!("Stopping backup manager...");
        self.reconciler.target().service.stop().await
    }

    /// Register `db_path` for replication under `app_id`
    pub async fn add_database(&self, app_id: &str, db_path: &Path) -> Result<(), PlatformError> {
        self.reconciler
            .add(app_id, db_path.to_path_buf())
            .await
            .with_context(|| format!("failed to register database for app {app_id}"))
    }

    pub async fn remove_database(&self, app_id: &str) -> Result<(), PlatformError> {
        self.reconciler
            .remove(app_id)
            .await
            .with_context(|| format!("failed to unregister database for app {app_id}"))
    }

    pub async fn databases(&self) -> BTreeMap<String, PathBuf> {
        self.reconciler.entries().await
    }

    pub fn config_file(&self) -> &File {
        self.reconciler.target().config_file()
    }

    /// Restore `db_path` from its replica.
    ///
    /// The daemon is stopped for the restore and started again afterwards,
    /// also when the restore fails.
    pub async fn restore_database(&self, app_id: &str, db_path: &Path) -> Result<Backup, PlatformError> {
        self.add_database(app_id, db_path).await?;

        let target = self.reconciler.target();
        target.service.stop().await?;

        let result = self.run_restore(db_path).await;

        if self.is_enabled() {
            if let Err(e) = target.service.start().await {
                error!(app_id, "Failed to restart Litestream after restore: {}", e);
            }
        }

        let size = match &result {
            Ok(()) => tokio::fs::metadata(db_path).await.map(|m| m.len()).unwrap_or_default(),
            Err(_) => 0,
        };
        let backup = Backup {
            id: generate_uuid(),
            app_id: app_id.to_string(),
            path: db_path.display().to_string(),
            size,
            status: if result.is_ok() {
                BackupStatus::Success
            } else {
                BackupStatus::Failed
            },
            created_at: Utc::now(),
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.create_backup(&backup).await {
                warn!(app_id, "Failed to record backup: {}", e);
            }
        }

        match result {
            Ok(()) => {
                info!(app_id, path = %backup.path, "Database restored");
                self.bus.publish(
                    Event::new(EventType::BackupCompleted, app_id, "Database restored")
                        .with_data("path", backup.path.clone())
                        .with_data("size", backup.size),
                );
                Ok(backup)
            }
            Err(e) => {
                self.bus.publish(
                    Event::new(EventType::BackupFailed, app_id, "Database restore failed")
                        .with_data("error", e.to_string()),
                );
                Err(e.wrap(format!("failed to restore database for app {app_id}")))
            }
        }
    }

    async fn run_restore(&self, db_path: &Path) -> Result<(), PlatformError> {
        let options = &self.reconciler.target().options;
        let output = Command::new(&options.binary)
            .arg("restore")
            .arg("-config")
            .arg(&options.config_file)
            .arg("-o")
            .arg(db_path)
            .arg(db_path)
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to run litestream restore")?;

        if !output.status.success() {
            return Err(PlatformError::external(
                "litestream restore",
                output.status.to_string(),
                combined_output(&output),
            ));
        }
        Ok(())
    }
}
