//! Error types for the shipyard platform

use thiserror::Error;

/// Main error type for the shipyard platform
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{tool} failed: {message}{}", format_output(.output))]
    ExternalTool {
        tool: String,
        message: String,
        output: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<PlatformError>,
    },
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(" (output: {trimmed})")
    }
}

impl PlatformError {
    /// Build an external tool failure with its captured output
    pub fn external(
        tool: impl Into<String>,
        message: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        PlatformError::ExternalTool {
            tool: tool.into(),
            message: message.into(),
            output: output.into(),
        }
    }

    /// Wrap this error with a layer of context
    pub fn wrap(self, context: impl Into<String>) -> Self {
        PlatformError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping every context layer
    pub fn root(&self) -> &PlatformError {
        let mut current = self;
        while let PlatformError::Context { source, .. } = current {
            current = source.as_ref();
        }
        current
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), PlatformError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), PlatformError::Conflict(_))
    }
}

/// Context wrapping for results, applied at each layer boundary
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, PlatformError>;

    fn with_context<C, F>(self, f: F) -> Result<T, PlatformError>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<PlatformError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, PlatformError> {
        self.map_err(|e| e.into().wrap(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T, PlatformError>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().wrap(f()))
    }
}
