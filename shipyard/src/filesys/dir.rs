//! Directory operations

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::fs;

use crate::errors::PlatformError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), PlatformError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), PlatformError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Recursively copy this directory's contents into `dest`
    pub async fn copy_to(&self, dest: &Dir) -> Result<(), PlatformError> {
        copy_recursive(self.path.clone(), dest.path.clone()).await
    }
}

fn copy_recursive(src: PathBuf, dest: PathBuf) -> BoxFuture<'static, Result<(), PlatformError>> {
    Box::pin(async move {
        fs::create_dir_all(&dest).await?;
        let mut entries = fs::read_dir(&src).await?;

        while let Some(entry) = entries.next_entry().await? {
            let target = dest.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_recursive(entry.path(), target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }

        Ok(())
    })
}
