//! Settings file management

use std::collections::HashMap;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;

use crate::logs::LogLevel;

/// Platform settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON formatted logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// REST API listener
    #[serde(default)]
    pub server: ServerSettings,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Process supervisor configuration
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Deployment pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Database replication configuration
    #[serde(default)]
    pub backup: BackupSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            supervisor: SupervisorSettings::default(),
            pipeline: PipelineSettings::default(),
            proxy: ProxySettings::default(),
            backup: BackupSettings::default(),
        }
    }
}

/// REST API listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSettings {
    /// Base directory; the platform default is used when absent
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

/// Supervisor settings
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    5
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_delay_secs: default_restart_delay(),
            sweep_interval_secs: default_sweep_interval(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

/// Deployment pipeline settings
#[derive(Debug, Deserialize)]
pub struct PipelineSettings {
    /// Outer bound for a whole deploy
    #[serde(default = "default_pipeline_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Port used when neither the app nor the build names one
    #[serde(default = "default_app_port")]
    pub default_port: u16,

    /// Register SQLite databases with the replication daemon
    #[serde(default = "default_true")]
    pub backup_databases: bool,

    /// Environment variables every app receives
    #[serde(default)]
    pub default_env: HashMap<String, String>,

    /// Token used to clone private GitHub repositories
    #[serde(default)]
    pub github_token: Option<SecretString>,
}

fn default_pipeline_timeout() -> u64 {
    15 * 60
}

fn default_deploy_timeout() -> u64 {
    5 * 60
}

fn default_fetch_timeout() -> u64 {
    5 * 60
}

fn default_build_timeout() -> u64 {
    10 * 60
}

fn default_app_port() -> u16 {
    8080
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_pipeline_timeout(),
            deploy_timeout_secs: default_deploy_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            build_timeout_secs: default_build_timeout(),
            default_port: default_app_port(),
            backup_databases: true,
            default_env: HashMap::new(),
            github_token: None,
        }
    }
}

/// Reverse proxy settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_caddy_binary")]
    pub binary: String,

    /// Admin endpoint address (host:port)
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,

    /// Base JSON document the routes are spliced into
    #[serde(default)]
    pub template_file: Option<PathBuf>,

    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Spawn the proxy ourselves; otherwise attach to a running instance
    #[serde(default = "default_true")]
    pub manage_process: bool,
}

fn default_caddy_binary() -> String {
    "caddy".to_string()
}

fn default_admin_addr() -> String {
    "localhost:2019".to_string()
}

fn default_reload_timeout() -> u64 {
    10
}

fn default_listen() -> Vec<String> {
    vec![":80".to_string()]
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            binary: default_caddy_binary(),
            admin_addr: default_admin_addr(),
            reload_timeout_secs: default_reload_timeout(),
            template_file: None,
            listen: default_listen(),
            manage_process: true,
        }
    }
}

/// Replication daemon settings
#[derive(Debug, Deserialize)]
pub struct BackupSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_litestream_binary")]
    pub binary: String,

    /// Path prefix inside the bucket
    #[serde(default = "default_destination")]
    pub destination: String,

    #[serde(default)]
    pub s3_bucket: String,

    #[serde(default)]
    pub s3_region: String,

    #[serde(default)]
    pub s3_endpoint: String,

    #[serde(default)]
    pub s3_access_key_id: String,

    #[serde(default)]
    pub s3_secret_access_key: Option<SecretString>,

    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,

    #[serde(default = "default_retention")]
    pub retention: String,
}

fn default_litestream_binary() -> String {
    "litestream".to_string()
}

fn default_destination() -> String {
    "backups".to_string()
}

fn default_sync_interval() -> String {
    "10s".to_string()
}

fn default_retention() -> String {
    "24h".to_string()
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_litestream_binary(),
            destination: default_destination(),
            s3_bucket: String::new(),
            s3_region: String::new(),
            s3_endpoint: String::new(),
            s3_access_key_id: String::new(),
            s3_secret_access_key: None,
            sync_interval: default_sync_interval(),
            retention: default_retention(),
        }
    }
}
