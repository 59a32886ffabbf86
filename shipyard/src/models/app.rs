//! Application models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::AppStatus;

/// An environment variable assigned to an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// A source-controlled application managed by the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    pub branch: String,

    /// Public hostname routed to the app
    pub domain: String,

    /// Explicit port; when absent the build or platform default applies
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub environment: Vec<EnvVar>,

    #[serde(default)]
    pub status: AppStatus,

    #[serde(default)]
    pub last_deploy: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when registering an application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewApplication {
    pub name: String,
    pub repo_url: String,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub environment: Vec<EnvVar>,
}
