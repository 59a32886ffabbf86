//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::DeploymentStatus;
use crate::errors::PlatformError;
use crate::utils::generate_uuid;

/// One deploy attempt of an application at a commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub app_id: String,

    /// Requested commit; empty means the branch head
    pub commit: String,

    pub status: DeploymentStatus,

    #[serde(default)]
    pub log: String,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Create a pending deployment starting now
    pub fn new(app_id: &str, commit: &str) -> Self {
        Self {
            id: generate_uuid(),
            app_id: app_id.to_string(),
            commit: commit.to_string(),
            status: DeploymentStatus::Pending,
            log: String::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Move to `next`, rejecting backward or post-terminal transitions
    pub fn transition(&mut self, next: DeploymentStatus) -> Result<(), PlatformError> {
        if !self.status.can_transition_to(next) {
            return Err(PlatformError::ValidationError(format!(
                "Invalid deployment transition: {} -> {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Enter a terminal state with its log and end timestamp
    pub fn finish(&mut self, status: DeploymentStatus, log: impl Into<String>) -> Result<(), PlatformError> {
        if !status.is_terminal() {
            return Err(PlatformError::ValidationError(format!(
                "{} is not a terminal deployment status",
                status.as_str()
            )));
        }
        self.transition(status)?;
        self.log = log.into();
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}
