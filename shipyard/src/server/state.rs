//! Server state

use std::sync::Arc;

use crate::deploy::pipeline::Pipeline;
use crate::reconcile::{BackupManager, ProxyManager};
use crate::store::RecordStore;
use crate::supervisor::Supervisor;

/// Server state shared across handlers
pub struct ServerState {
    pub store: Arc<dyn RecordStore>,
    pub pipeline: Arc<Pipeline>,
    pub supervisor: Supervisor,
    pub proxy: Arc<ProxyManager>,
    pub backup: Arc<BackupManager>,
}

impl ServerState {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pipeline: Arc<Pipeline>,
        supervisor: Supervisor,
        proxy: Arc<ProxyManager>,
        backup: Arc<BackupManager>,
    ) -> Self {
        Self {
            store,
            pipeline,
            supervisor,
            proxy,
            backup,
        }
    }
}
