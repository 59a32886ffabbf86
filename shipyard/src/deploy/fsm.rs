//! Status state machines for deployments, applications and processes

use serde::{Deserialize, Serialize};

/// Deployment attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Record created, no step started yet
    Pending,

    /// Steps are executing
    InProgress,

    /// Every step completed
    Success,

    /// A step failed or the attempt timed out
    Failed,
}

impl DeploymentStatus {
    /// Success and Failed are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::Failed)
    }

    /// Transitions only move forward and never leave a terminal state
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Success) | (Pending, Failed)
                | (InProgress, Success)
                | (InProgress, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }
}

/// Application lifecycle status as recorded in the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    #[default]
    Pending,
    Running,
    Stopped,
    Failed,
    Undeployed,
}

/// Supervisor view of a managed process.
///
/// `absent -> Running -> {Stopped | Crashed}`, `Crashed -> Running` only
/// through an auto-restart or an explicit start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Crashed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}
