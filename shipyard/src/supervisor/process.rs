//! Managed process records and signal handling

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::deploy::fsm::ProcessStatus;
use crate::errors::PlatformError;

/// Environment handed to a managed process, applied over the inherited one
pub type Env = BTreeMap<String, String>;

/// Supervisor-internal state of one managed application
#[derive(Debug)]
pub(crate) struct ProcessRecord {
    pub app_id: String,
    pub exec_path: PathBuf,
    pub env: Env,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub restarts: u32,
    pub status: ProcessStatus,

    /// Distinguishes successive spawns under the same app id
    pub instance: u64,

    /// Flips to `true` once the waiter has reaped the process
    pub exited: watch::Receiver<bool>,
}

impl ProcessRecord {
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            app_id: self.app_id.clone(),
            pid: self.pid,
            started_at: self.started_at,
            restarts: self.restarts,
            status: self.status,
        }
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Signal-zero liveness probe; only ESRCH counts as dead
    pub fn probe(&self) -> Result<(), Errno> {
        let Some(pid) = self.pid else {
            return Err(Errno::ESRCH);
        };
        match kill(to_pid(pid), None) {
            Ok(()) | Err(Errno::EPERM) => Ok(()),
            Err(errno) => Err(errno),
        }
    }
}

/// Read-only snapshot of a managed process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub app_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub restarts: u32,
    pub status: ProcessStatus,
}

fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

/// Send SIGTERM, wait up to `stop_timeout`, then SIGKILL.
///
/// Returns once the waiter reports the process reaped.
pub(crate) async fn terminate(record: &ProcessRecord, stop_timeout: Duration) -> Result<(), PlatformError> {
    let Some(raw_pid) = record.pid else {
        return Ok(());
    };
    if record.has_exited() {
        return Ok(());
    }

    let pid = to_pid(raw_pid);
    let mut exited = record.exited.clone();

    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            debug!(app_id = %record.app_id, pid = raw_pid, "Process already gone");
        }
        Err(e) => {
            warn!(app_id = %record.app_id, pid = raw_pid, "Failed to send SIGTERM: {}", e);
            force_kill(pid)?;
        }
    }

    let exited_in_time = tokio::time::timeout(stop_timeout, exited.wait_for(|done| *done))
        .await
        .is_ok();
    if exited_in_time {
        return Ok(());
    }

    warn!(
        app_id = %record.app_id,
        pid = raw_pid,
        "Process did not exit within {:?}, force killing",
        stop_timeout
    );
    force_kill(pid)?;

    let reaped = tokio::time::timeout(stop_timeout, exited.wait_for(|done| *done))
        .await
        .is_ok();
    if !reaped {
        return Err(PlatformError::Timeout(format!(
            "process {raw_pid} of app {} survived SIGKILL",
            record.app_id
        )));
    }
    Ok(())
}

fn force_kill(pid: Pid) -> Result<(), PlatformError> {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(PlatformError::Internal(format!("failed to kill process {pid}: {e}"))),
    }
}
