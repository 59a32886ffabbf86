//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the platform
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Deployed applications, one working directory per app id
    pub fn apps_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("apps"))
    }

    /// Persistent per-app data (databases) that survives undeploy
    pub fn app_data_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("app-data"))
    }

    /// Checked-out repositories
    pub fn source_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("source"))
    }

    /// Build outputs
    pub fn builds_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("builds"))
    }

    /// Platform-owned state and generated configuration
    pub fn system_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("system"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Record store file
    pub fn records_file(&self) -> File {
        self.system_dir().file("records.json")
    }

    /// Generated reverse-proxy configuration
    pub fn proxy_config_file(&self) -> File {
        self.system_dir().file("caddy.json")
    }

    /// Generated replication daemon configuration
    pub fn backup_config_file(&self) -> File {
        self.system_dir().file("litestream.yml")
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::PlatformError> {
        self.apps_dir().create().await?;
        self.app_data_dir().create().await?;
        self.source_dir().create().await?;
        self.builds_dir().create().await?;
        self.system_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/shipyard");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shipyard");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
