//! Deployment module

pub mod builder;
pub mod deployer;
pub mod fsm;
pub mod pipeline;
pub mod source;
pub mod webhook;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{PlatformError, ResultExt};
use crate::utils::combined_output;

/// Retrieves application source code
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Clone or update `repo_url` at `branch`, then check out `commit` when
    /// given; returns the checkout directory
    async fn fetch_source(&self, repo_url: &str, branch: &str, commit: &str) -> Result<PathBuf, PlatformError>;

    async fn cleanup_source(&self, path: &Path) -> Result<(), PlatformError>;
}

/// Detects a project's toolchain and builds it
#[async_trait]
pub trait AppBuilder: Send + Sync {
    async fn detect_and_build(&self, source_dir: &Path, build_id: &str) -> Result<BuildResult, PlatformError>;
}

/// Detected project toolchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Go,
    Rust,
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppKind::Go => f.write_str("go"),
            AppKind::Rust => f.write_str("rust"),
        }
    }
}

/// Output of a successful build
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub kind: AppKind,
    pub binary_path: PathBuf,

    /// Port found in the source, if any
    pub default_port: Option<u16>,

    pub uses_database: bool,

    /// Static asset directory inside the source tree
    pub static_dir: Option<PathBuf>,
}

/// Run an external tool under `limit`, capturing its output.
///
/// The child is killed if the limit elapses or the caller is cancelled.
pub(crate) async fn run_tool(tool: &str, command: &mut Command, limit: Duration) -> Result<String, PlatformError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(tool, limit = ?limit, "Running external tool");
    let output = match tokio::time::timeout(limit, command.output()).await {
        Ok(output) => output.with_context(|| format!("failed to run {tool}"))?,
        Err(_) => {
            return Err(PlatformError::Timeout(format!("{tool} exceeded {limit:?}")));
        }
    };

    let text = combined_output(&output);
    if !output.status.success() {
        return Err(PlatformError::external(tool, output.status.to_string(), text));
    }
    Ok(text)
}
