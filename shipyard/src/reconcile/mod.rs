//! Declarative reconciliation of external daemons.
//!
//! A [`Reconciler`] owns a desired-state map keyed by app id. Every change
//! renders the whole map into the daemon's native configuration, writes it
//! where the daemon reads it and asks the daemon to adopt it, all while the
//! map lock is held so concurrent changes serialize around full reconciles.
//! The rendered artifact depends only on the map contents, never on the
//! order entries were added or removed.

pub mod backup;
pub mod proxy;
pub mod service;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::{PlatformError, ResultExt};
use crate::filesys::file::File;

pub use backup::BackupManager;
pub use proxy::{ProxyManager, Route};
pub use service::ManagedService;

/// External system driven by a [`Reconciler`]
#[async_trait]
pub trait ReconcileTarget: Send + Sync {
    /// Desired state of one entry
    type Spec: Clone + Send + Sync;

    /// Name used in logs and errors
    fn name(&self) -> &'static str;

    /// File the daemon reads its configuration from
    fn config_file(&self) -> &File;

    /// Render the complete configuration for `entries`
    async fn render(&self, entries: &BTreeMap<String, Self::Spec>) -> Result<Vec<u8>, PlatformError>;

    /// Make the daemon adopt `config`; a daemon that is not running is left alone
    async fn reload(&self, config: &[u8]) -> Result<(), PlatformError>;
}

/// Desired-state map plus full regenerate-and-reload on every change
pub struct Reconciler<T: ReconcileTarget> {
    target: T,
    entries: Mutex<BTreeMap<String, T::Spec>>,
}

impl<T: ReconcileTarget> Reconciler<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Insert or replace `id`, then reconcile
    pub async fn add(&self, id: &str, spec: T::Spec) -> Result<(), PlatformError> {
        let mut entries = self.entries.lock().await;
        entries.insert(id.to_string(), spec);
        self.apply(&entries).await
    }

    /// Remove `id`, then reconcile; unknown ids succeed without touching the daemon
    pub async fn remove(&self, id: &str) -> Result<(), PlatformError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(id).is_none() {
            debug!(target_name = self.target.name(), id, "Entry not present, nothing to reconcile");
            return Ok(());
        }
        self.apply(&entries).await
    }

    pub async fn get(&self, id: &str) -> Option<T::Spec> {
        self.entries.lock().await.get(id).cloned()
    }

    pub async fn entries(&self) -> BTreeMap<String, T::Spec> {
        self.entries.lock().await.clone()
    }

    /// Write the configuration for the current map without reloading
    pub async fn regenerate(&self) -> Result<Vec<u8>, PlatformError> {
        let entries = self.entries.lock().await;
        self.write(&entries).await
    }

    async fn write(&self, entries: &BTreeMap<String, T::Spec>) -> Result<Vec<u8>, PlatformError> {
        let name = self.target.name();
        let config = self
            .target
            .render(entries)
            .await
            .with_context(|| format!("failed to generate {name} config"))?;

        self.target
            .config_file()
            .write_atomic(&config)
            .await
            .with_context(|| format!("failed to write {name} config"))?;

        debug!(target_name = name, entries = entries.len(), "Regenerated config");
        Ok(config)
    }

    async fn apply(&self, entries: &BTreeMap<String, T::Spec>) -> Result<(), PlatformError> {
        let config = self.write(entries).await?;
        self.target
            .reload(&config)
            .await
            .with_context(|| format!("failed to reload {}", self.target.name()))
    }
}
