//! Application configuration options

use std::sync::Arc;
use std::time::Duration;

use crate::deploy::{builder, deployer, pipeline, source};
use crate::reconcile::{backup, proxy};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::supervisor;
use crate::workers::sweeper;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// On-disk layout
    pub layout: StorageLayout,

    /// REST API listener
    pub server: ServerOptions,

    pub supervisor: supervisor::Options,

    pub sweeper: sweeper::Options,

    pub pipeline: pipeline::Options,

    pub source: source::Options,

    pub builder: builder::Options,

    pub deployer: deployer::Options,

    pub proxy: proxy::Options,

    pub backup: backup::Options,
}

impl AppOptions {
    /// Derive runtime options from the settings file, rooted at `layout`
    pub fn from_settings(settings: Settings, layout: StorageLayout) -> Self {
        let apps_dir = layout.apps_dir().path().to_path_buf();
        let logs_dir = layout.logs_dir().path().to_path_buf();
        let stop_timeout = Duration::from_secs(settings.supervisor.stop_timeout_secs);

        Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions {
                host: settings.server.host,
                port: settings.server.port,
            },
            supervisor: supervisor::Options {
                apps_dir: apps_dir.clone(),
                max_restarts: settings.supervisor.max_restarts,
                restart_delay: Duration::from_secs(settings.supervisor.restart_delay_secs),
                stop_timeout,
                ..Default::default()
            },
            sweeper: sweeper::Options {
                interval: Duration::from_secs(settings.supervisor.sweep_interval_secs),
            },
            pipeline: pipeline::Options {
                timeout: Duration::from_secs(settings.pipeline.timeout_secs),
            },
            source: source::Options {
                source_dir: layout.source_dir().path().to_path_buf(),
                fetch_timeout: Duration::from_secs(settings.pipeline.fetch_timeout_secs),
                github_token: settings.pipeline.github_token.map(Arc::new),
                ..Default::default()
            },
            builder: builder::Options {
                output_dir: layout.builds_dir().path().to_path_buf(),
                build_timeout: Duration::from_secs(settings.pipeline.build_timeout_secs),
                ..Default::default()
            },
            deployer: deployer::Options {
                apps_dir,
                data_dir: layout.app_data_dir().path().to_path_buf(),
                default_port: settings.pipeline.default_port,
                default_env: settings.pipeline.default_env.into_iter().collect(),
                backup_databases: settings.pipeline.backup_databases,
                deploy_timeout: Duration::from_secs(settings.pipeline.deploy_timeout_secs),
            },
            proxy: proxy::Options {
                binary: settings.proxy.binary,
                admin_addr: settings.proxy.admin_addr,
                reload_timeout: Duration::from_secs(settings.proxy.reload_timeout_secs),
                template_file: settings.proxy.template_file,
                listen: settings.proxy.listen,
                manage_process: settings.proxy.manage_process,
                config_file: layout.proxy_config_file().path().to_path_buf(),
                log_file: Some(logs_dir.join("caddy.log")),
            },
            backup: backup::Options {
                enabled: settings.backup.enabled,
                binary: settings.backup.binary,
                destination: settings.backup.destination,
                s3_bucket: settings.backup.s3_bucket,
                s3_region: settings.backup.s3_region,
                s3_endpoint: settings.backup.s3_endpoint,
                s3_access_key_id: settings.backup.s3_access_key_id,
                s3_secret_access_key: settings.backup.s3_secret_access_key.map(Arc::new),
                sync_interval: settings.backup.sync_interval,
                retention: settings.backup.retention,
                config_file: layout.backup_config_file().path().to_path_buf(),
                log_file: Some(logs_dir.join("litestream.log")),
                stop_timeout,
            },
            layout,
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(Settings::default(), StorageLayout::default())
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// REST API listener options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
