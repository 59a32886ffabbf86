//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::PlatformError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::sweeper;

/// Run the platform until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PlatformError> {
    info!("Initializing Shipyard...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start platform: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PlatformError> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_sweeper_worker(
        options.sweeper.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await
}

fn init_sweeper_worker(
    options: sweeper::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PlatformError> {
    info!("Initializing sweeper worker...");

    let supervisor = app_state.supervisor.clone();
    let sweeper_handle = tokio::spawn(async move {
        sweeper::run(
            &options,
            &supervisor,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_sweeper_worker_handle(sweeper_handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PlatformError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(
        app_state.store.clone(),
        app_state.pipeline.clone(),
        app_state.supervisor.clone(),
        app_state.proxy.clone(),
        app_state.backup.clone(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), PlatformError>>>,
    sweeper_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            sweeper_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), PlatformError> {
        if self.app_state.is_some() {
            return Err(PlatformError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_sweeper_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PlatformError> {
        if self.sweeper_worker_handle.is_some() {
            return Err(PlatformError::ShutdownError("sweeper_handle already set".to_string()));
        }
        self.sweeper_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), PlatformError>>,
    ) -> Result<(), PlatformError> {
        if self.server_handle.is_some() {
            return Err(PlatformError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), PlatformError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.lifecycle_options.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), PlatformError> {
        info!("Shutting down Shipyard...");

        // 1. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))??;
        }

        // 2. Sweeper worker
        if let Some(handle) = self.sweeper_worker_handle.take() {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))?;
        }

        // 3. Managed apps, replication daemon, proxy
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
