//! GitHub webhook payloads

use serde::Deserialize;

use crate::errors::PlatformError;

/// Header naming the delivered event type
pub const EVENT_HEADER: &str = "X-GitHub-Event";

const BRANCH_PREFIX: &str = "refs/heads/";

/// A push to a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub repo_url: String,
    pub branch: String,

    /// Head commit; empty when the push deleted the branch
    pub commit: String,
}

/// A parsed webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Ping,
    Push(PushEvent),

    /// Accepted and ignored
    Other(String),
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: RepositoryPayload,
    #[serde(default)]
    head_commit: Option<CommitPayload>,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    html_url: String,
}

#[derive(Deserialize)]
struct CommitPayload {
    id: String,
}

impl WebhookEvent {
    /// Parse a delivery from its event type header and raw body
    pub fn parse(event_type: &str, body: &[u8]) -> Result<Self, PlatformError> {
        match event_type.trim() {
            "" => Err(PlatformError::ValidationError(format!("missing {EVENT_HEADER} header"))),
            "ping" => Ok(WebhookEvent::Ping),
            "push" => {
                let payload: PushPayload = serde_json::from_slice(body)
                    .map_err(|e| PlatformError::ValidationError(format!("invalid push payload: {e}")))?;
                let branch = payload
                    .git_ref
                    .strip_prefix(BRANCH_PREFIX)
                    .unwrap_or(&payload.git_ref)
                    .to_string();
                Ok(WebhookEvent::Push(PushEvent {
                    repo_url: payload.repository.html_url,
                    branch,
                    commit: payload.head_commit.map(|c| c.id).unwrap_or_default(),
                }))
            }
            other => Ok(WebhookEvent::Other(other.to_string())),
        }
    }
}

impl PushEvent {
    /// Whether an app tracking `repo_url` at `branch` should deploy this push
    pub fn matches(&self, repo_url: &str, branch: &str) -> bool {
        self.branch == branch && normalize_repo_url(&self.repo_url) == normalize_repo_url(repo_url)
    }
}

fn normalize_repo_url(url: &str) -> &str {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url)
}
