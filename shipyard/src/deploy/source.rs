//! Git source fetcher

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret as _, SecretString};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::deploy::{run_tool, SourceFetcher};
use crate::errors::{PlatformError, ResultExt};

/// Git fetcher options
#[derive(Debug, Clone)]
pub struct Options {
    pub git_binary: String,

    /// Parent of every checkout
    pub source_dir: PathBuf,

    /// Bound for one fetch (clone or update plus checkout)
    pub fetch_timeout: Duration,

    /// Token injected into https://github.com clone URLs
    pub github_token: Option<Arc<SecretString>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            git_binary: "git".to_string(),
            source_dir: PathBuf::from("source"),
            fetch_timeout: Duration::from_secs(5 * 60),
            github_token: None,
        }
    }
}

/// Fetches sources with the git CLI; one checkout per repository and branch
pub struct GitFetcher {
    options: Options,
    lock: Mutex<()>,
}

/// Checkout directory name for a repository URL (`owner-repo`)
pub fn repo_dir_name(repo_url: &str) -> Result<String, PlatformError> {
    let url = Url::parse(repo_url)
        .map_err(|e| PlatformError::ValidationError(format!("invalid repository URL {repo_url}: {e}")))?;

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let name = match segments.as_slice() {
        [] => {
            return Err(PlatformError::ValidationError(format!(
                "repository URL {repo_url} has no path"
            )))
        }
        [repo] => repo.trim_end_matches(".git").to_string(),
        [.., owner, repo] => format!("{owner}-{}", repo.trim_end_matches(".git")),
    };

    if name.is_empty() || name.starts_with('.') {
        return Err(PlatformError::ValidationError(format!(
            "cannot derive a directory name from {repo_url}"
        )));
    }
    Ok(name)
}

/// Checkout directory name for one branch of a repository (`owner-repo@branch`)
pub fn checkout_dir_name(repo_url: &str, branch: &str) -> Result<String, PlatformError> {
    let repo = repo_dir_name(repo_url)?;
    let branch: String = branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .collect();
    if branch.is_empty() || branch.starts_with('.') {
        return Err(PlatformError::ValidationError(format!("invalid branch name {branch:?}")));
    }
    Ok(format!("{repo}@{branch}"))
}

impl GitFetcher {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            lock: Mutex::new(()),
        }
    }

    fn clone_url(&self, repo_url: &str) -> Result<String, PlatformError> {
        let Some(token) = &self.options.github_token else {
            return Ok(repo_url.to_string());
        };
        let mut url = Url::parse(repo_url)
            .map_err(|e| PlatformError::ValidationError(format!("invalid repository URL: {e}")))?;
        if url.scheme() == "https" && url.host_str() == Some("github.com") {
            url.set_username(token.expose_secret())
                .map_err(|_| PlatformError::Internal("failed to set clone credentials".to_string()))?;
        }
        Ok(url.to_string())
    }

    fn redact(&self, err: PlatformError) -> PlatformError {
        let Some(token) = &self.options.github_token else {
            return err;
        };
        let secret = token.expose_secret();
        if secret.is_empty() {
            return err;
        }
        match err {
            PlatformError::ExternalTool { tool, message, output } => PlatformError::ExternalTool {
                tool,
                message,
                output: output.replace(secret, "***"),
            },
            other => other,
        }
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, PlatformError> {
        let mut command = Command::new(&self.options.git_binary);
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        let tool = format!("git {}", args.first().copied().unwrap_or_default());
        run_tool(&tool, &mut command, self.options.fetch_timeout)
            .await
            .map_err(|e| self.redact(e))
    }

    async fn sync(&self, repo_url: &str, branch: &str, commit: &str, dir: &Path) -> Result<(), PlatformError> {
        if tokio::fs::metadata(dir.join(".git")).await.is_ok() {
            info!(repo_url, branch, "Updating existing repository");
            self.git(Some(dir), &["fetch", "origin", branch])
                .await
                .context("failed to update repository")?;
            let remote_branch = format!("origin/{branch}");
            self.git(Some(dir), &["checkout", "-f", "-B", branch, &remote_branch])
                .await
                .context("failed to update repository")?;
        } else {
            info!(repo_url, branch, "Cloning new repository");
            if tokio::fs::metadata(dir).await.is_ok() {
                warn!(path = %dir.display(), "Removing leftover non-git directory");
                tokio::fs::remove_dir_all(dir).await?;
            }
            let clone_url = self.clone_url(repo_url)?;
            let target = dir.display().to_string();
            self.git(None, &["clone", "--branch", branch, &clone_url, &target])
                .await
                .context("failed to clone repository")?;
        }

        if !commit.is_empty() && commit != "HEAD" {
            info!(repo_url, commit, "Checking out commit");
            self.git(Some(dir), &["checkout", "-f", commit])
                .await
                .context("failed to checkout commit")?;
        }
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch_source(&self, repo_url: &str, branch: &str, commit: &str) -> Result<PathBuf, PlatformError> {
        let dir = self.options.source_dir.join(checkout_dir_name(repo_url, branch)?);
        tokio::fs::create_dir_all(&self.options.source_dir).await?;

        let _guard = self.lock.lock().await;
        self.sync(repo_url, branch, commit, &dir).await?;

        info!(repo_url, branch, path = %dir.display(), "Source code fetched");
        Ok(dir)
    }

    async fn cleanup_source(&self, path: &Path) -> Result<(), PlatformError> {
        info!(path = %path.display(), "Cleaning up source directory");
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PlatformError::from(e).wrap("failed to remove source directory")),
        }
    }
}
