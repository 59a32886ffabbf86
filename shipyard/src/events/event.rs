//! Lifecycle events published by the pipeline, supervisor and reconcilers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle tag of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A deploy attempt started
    DeployStarted,
    /// A deploy attempt finished with the app running
    AppDeployed,
    /// A deploy attempt failed at one of its steps
    DeployFailed,
    UndeployStarted,
    AppUndeployed,
    AppStarted,
    AppStopped,
    /// A managed process exited without being stopped
    AppFailed,
    BackupCompleted,
    BackupFailed,
    ProxyConfigured,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::DeployStarted,
        EventType::AppDeployed,
        EventType::DeployFailed,
        EventType::UndeployStarted,
        EventType::AppUndeployed,
        EventType::AppStarted,
        EventType::AppStopped,
        EventType::AppFailed,
        EventType::BackupCompleted,
        EventType::BackupFailed,
        EventType::ProxyConfigured,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DeployStarted => "deploy_started",
            EventType::AppDeployed => "app_deployed",
            EventType::DeployFailed => "deploy_failed",
            EventType::UndeployStarted => "undeploy_started",
            EventType::AppUndeployed => "app_undeployed",
            EventType::AppStarted => "app_started",
            EventType::AppStopped => "app_stopped",
            EventType::AppFailed => "app_failed",
            EventType::BackupCompleted => "backup_completed",
            EventType::BackupFailed => "backup_failed",
            EventType::ProxyConfigured => "proxy_configured",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ephemeral notification; never persisted or replayed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub app_id: String,
    pub message: String,

    /// Opaque payload (deployment id, commit, error text, ...)
    #[serde(default)]
    pub data: Map<String, Value>,

    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, app_id: &str, message: impl Into<String>) -> Self {
        Self {
            event_type,
            app_id: app_id.to_string(),
            message: message.into(),
            data: Map::new(),
            published_at: Utc::now(),
        }
    }

    /// Attach a payload field
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// A string payload field, if present
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}
