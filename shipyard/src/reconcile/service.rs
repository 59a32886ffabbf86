//! External daemon processes started and stopped by the platform

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{PlatformError, ResultExt};

/// A long-running helper daemon (proxy, replication) owned by the platform
pub struct ManagedService {
    name: &'static str,
    program: String,
    args: Vec<String>,
    log_file: Option<PathBuf>,
    stop_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl ManagedService {
    pub fn new(name: &'static str, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name,
            program: program.into(),
            args,
            log_file: None,
            stop_timeout: Duration::from_secs(5),
            child: Mutex::new(None),
        }
    }

    /// Append daemon output to `path` instead of discarding it
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn the daemon unless it is already running
    pub async fn start(&self) -> Result<(), PlatformError> {
        let mut child = self.child.lock().await;
        if let Some(existing) = child.as_mut() {
            if existing.try_wait()?.is_none() {
                debug!(service = self.name, "Already running");
                return Ok(());
            }
        }

        let (stdout, stderr) = match &self.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
                let clone = file.try_clone()?;
                (Stdio::from(file), Stdio::from(clone))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.name))?;

        info!(service = self.name, pid = ?spawned.id(), "Started {}", self.program);
        *child = Some(spawned);
        Ok(())
    }

    /// SIGTERM, bounded wait, then SIGKILL; a daemon that is not running is fine
    pub async fn stop(&self) -> Result<(), PlatformError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        if child.try_wait()?.is_some() {
            return Ok(());
        }

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(service = self.name, pid, "Failed to send SIGTERM: {}", e);
            }
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(status) => {
                info!(service = self.name, "Stopped ({})", status?);
            }
            Err(_) => {
                warn!(service = self.name, "Did not stop within {:?}, killing", self.stop_timeout);
                child.kill().await?;
            }
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), PlatformError> {
        self.stop().await?;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}
