//! Backup models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a backup or restore operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Success,
    Failed,
}

/// A recorded backup/restore of an application database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub app_id: String,
    pub path: String,
    pub size: u64,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
}
