//! Application state management

use std::sync::Arc;

use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::deploy::builder::ToolchainBuilder;
use crate::deploy::deployer::{BackupClient, Deployer};
use crate::deploy::pipeline::Pipeline;
use crate::deploy::source::GitFetcher;
use crate::errors::{PlatformError, ResultExt};
use crate::events::{EventBus, EventLogger};
use crate::reconcile::{BackupManager, ProxyManager};
use crate::storage::layout::StorageLayout;
use crate::store::{JsonRecordStore, RecordStore};
use crate::supervisor::Supervisor;

/// Main application state
pub struct AppState {
    pub layout: StorageLayout,

    pub store: Arc<dyn RecordStore>,

    pub bus: Arc<EventBus>,

    pub supervisor: Supervisor,

    pub proxy: Arc<ProxyManager>,

    pub backup: Arc<BackupManager>,

    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    /// Build every component and bring the external daemons up.
    ///
    /// Only an unusable record store or layout is fatal; daemon start
    /// failures are logged and the daemons pick up their config when they
    /// next start.
    pub async fn init(options: &AppOptions) -> Result<Self, PlatformError> {
        info!("Initializing application state...");

        let layout = options.layout.clone();
        layout.setup().await.context("failed to create storage layout")?;

        let store: Arc<dyn RecordStore> = Arc::new(
            JsonRecordStore::open(layout.records_file())
                .await
                .context("failed to open record store")?,
        );

        let bus = Arc::new(EventBus::default());
        EventLogger::attach(&bus);

        let supervisor = Supervisor::new(options.supervisor.clone(), bus.clone());

        let proxy = Arc::new(ProxyManager::new(options.proxy.clone(), bus.clone())?);
        if let Err(e) = proxy.start().await {
            error!("Failed to start reverse proxy: {}", e);
        }

        let backup = Arc::new(BackupManager::new(options.backup.clone(), bus.clone()).with_store(store.clone()));
        if let Err(e) = backup.start().await {
            error!("Failed to start replication daemon: {}", e);
        }

        let backup_client: Option<Arc<dyn BackupClient>> = backup
            .is_enabled()
            .then(|| backup.clone() as Arc<dyn BackupClient>);
        let deployer = Arc::new(Deployer::new(
            options.deployer.clone(),
            store.clone(),
            Arc::new(supervisor.clone()),
            proxy.clone(),
            backup_client,
        ));

        let pipeline = Arc::new(Pipeline::new(
            options.pipeline.clone(),
            store.clone(),
            bus.clone(),
            Arc::new(GitFetcher::new(options.source.clone())),
            Arc::new(ToolchainBuilder::new(options.builder.clone())),
            deployer,
        ));

        Ok(Self {
            layout,
            store,
            bus,
            supervisor,
            proxy,
            backup,
            pipeline,
        })
    }

    /// Stop managed apps, then the daemons
    pub async fn shutdown(&self) -> Result<(), PlatformError> {
        info!("Shutting down application state...");

        self.supervisor.stop_all().await;

        if let Err(e) = self.backup.stop().await {
            error!("Failed to stop replication daemon: {}", e);
        }
        self.proxy.stop().await.context("failed to stop reverse proxy")?;

        self.bus.clear();
        Ok(())
    }
}
