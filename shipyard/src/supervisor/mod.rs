//! Process supervisor.
//!
//! Owns every managed application process. Each spawn gets a waiter task
//! that owns the child handle and reports its exit; a periodic sweep probes
//! running records independently. Both paths funnel into the same crash
//! handling, which only acts on the record instance it was created for.

pub mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::ProcessStatus;
use crate::errors::{PlatformError, ResultExt};
use crate::events::{Event, EventBus, EventType};

pub use process::{Env, ProcessInfo};
use process::{terminate, ProcessRecord};

/// Supervisor options
#[derive(Debug, Clone)]
pub struct Options {
    /// Parent of every app working directory (`<apps>/<id>`)
    pub apps_dir: PathBuf,

    /// Automatic restarts allowed after crashes before giving up
    pub max_restarts: u32,

    /// Backoff before an automatic restart
    pub restart_delay: Duration,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,

    /// Pause between the stop and start halves of a restart
    pub restart_settle_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            apps_dir: PathBuf::from("apps"),
            max_restarts: 5,
            restart_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            restart_settle_delay: Duration::from_millis(500),
        }
    }
}

struct Inner {
    options: Options,
    bus: Arc<EventBus>,
    procs: RwLock<HashMap<String, ProcessRecord>>,
    next_instance: AtomicU64,
}

/// Cloneable handle to the process supervisor
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(options: Options, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                bus,
                procs: RwLock::new(HashMap::new()),
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Working directory of an app
    pub fn app_dir(&self, app_id: &str) -> PathBuf {
        self.inner.options.apps_dir.join(app_id)
    }

    /// Spawn `exec_path` for `app_id`; Conflict if it is already running.
    ///
    /// An explicit start resets the automatic restart counter.
    pub async fn start_app(&self, app_id: &str, exec_path: &Path, env: &Env) -> Result<(), PlatformError> {
        let mut procs = self.inner.procs.write().await;

        if let Some(existing) = procs.get(app_id) {
            if existing.status == ProcessStatus::Running {
                return Err(PlatformError::Conflict(format!("app {app_id} is already running")));
            }
        }

        let record = self
            .spawn(app_id, exec_path, env, 0)
            .await
            .with_context(|| format!("failed to start app {app_id}"))?;
        procs.insert(app_id.to_string(), record);
        Ok(())
    }

    /// Stop an app: SIGTERM, bounded wait, SIGKILL.
    ///
    /// Always leaves the record `stopped`, which also cancels a pending
    /// automatic restart of a crashed record.
    pub async fn stop_app(&self, app_id: &str) -> Result<(), PlatformError> {
        let mut procs = self.inner.procs.write().await;
        let record = procs
            .get_mut(app_id)
            .ok_or_else(|| PlatformError::NotFound(format!("app {app_id} is not managed by supervisor")))?;

        let result = if record.status == ProcessStatus::Running {
            info!(app_id, pid = ?record.pid, "Stopping app...");
            terminate(record, self.inner.options.stop_timeout).await
        } else {
            debug!(app_id, status = %record.status, "App not running, marking stopped");
            Ok(())
        };
        record.status = ProcessStatus::Stopped;
        drop(procs);

        self.inner.bus.publish(Event::new(
            EventType::AppStopped,
            app_id,
            format!("App {app_id} stopped"),
        ));

        result.with_context(|| format!("failed to stop app {app_id}"))
    }

    /// Stop, settle, then start again with the same executable and environment
    pub async fn restart_app(&self, app_id: &str) -> Result<(), PlatformError> {
        let (exec_path, env) = {
            let procs = self.inner.procs.read().await;
            let record = procs.get(app_id).ok_or_else(|| {
                PlatformError::NotFound(format!("app {app_id} is not managed by supervisor"))
            })?;
            (record.exec_path.clone(), record.env.clone())
        };

        self.stop_app(app_id).await?;
        tokio::time::sleep(self.inner.options.restart_settle_delay).await;
        self.start_app(app_id, &exec_path, &env).await
    }

    pub async fn status(&self, app_id: &str) -> Result<ProcessStatus, PlatformError> {
        self.inner
            .procs
            .read()
            .await
            .get(app_id)
            .map(|record| record.status)
            .ok_or_else(|| PlatformError::NotFound(format!("app {app_id} is not managed by supervisor")))
    }

    pub async fn info(&self, app_id: &str) -> Result<ProcessInfo, PlatformError> {
        self.inner
            .procs
            .read()
            .await
            .get(app_id)
            .map(ProcessRecord::info)
            .ok_or_else(|| PlatformError::NotFound(format!("app {app_id} is not managed by supervisor")))
    }

    pub async fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> =
            self.inner.procs.read().await.values().map(ProcessRecord::info).collect();
        infos.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        infos
    }

    /// Probe every running record and hand dead ones to crash handling.
    ///
    /// Runs under the read lock; recovery happens on separate tasks because
    /// it needs the write lock. Returns the number of dead records found.
    pub async fn check_processes(&self) -> usize {
        let procs = self.inner.procs.read().await;
        let mut dead = 0;

        for record in procs.values() {
            if record.status != ProcessStatus::Running {
                continue;
            }
            if let Err(errno) = record.probe() {
                warn!(
                    app_id = %record.app_id,
                    pid = ?record.pid,
                    "App seems to have died outside our control: {}",
                    errno
                );
                dead += 1;

                let supervisor = self.clone();
                let app_id = record.app_id.clone();
                let instance = record.instance;
                let message = format!("Process {:?} is no longer alive: {errno}", record.pid);
                tokio::spawn(async move {
                    supervisor.handle_exit(app_id, instance, message).await;
                });
            }
        }
        dead
    }

    /// Stop every running app; used at shutdown
    pub async fn stop_all(&self) {
        info!("Stopping all managed apps...");
        let ids: Vec<String> = self.inner.procs.read().await.keys().cloned().collect();
        for app_id in ids {
            if let Err(e) = self.stop_app(&app_id).await {
                error!(app_id, "Error stopping app: {}", e);
            }
        }
    }

    async fn spawn(
        &self,
        app_id: &str,
        exec_path: &Path,
        env: &Env,
        restarts: u32,
    ) -> Result<ProcessRecord, PlatformError> {
        let work_dir = self.app_dir(app_id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(work_dir.join("app.log"))
            .await
            .context("failed to open log file")?
            .into_std()
            .await;
        let stderr_file = log_file.try_clone()?;

        let mut child = Command::new(exec_path)
            .envs(env)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let (exit_tx, exit_rx) = watch::channel(false);

        info!(app_id, pid = ?pid, restarts, "App started");
        self.inner.bus.publish(
            Event::new(
                EventType::AppStarted,
                app_id,
                format!("App {app_id} started with PID {}", pid.unwrap_or_default()),
            )
            .with_data("pid", pid.unwrap_or_default()),
        );

        let supervisor = self.clone();
        let waiter_app_id = app_id.to_string();
        tokio::spawn(async move {
            let message = match child.wait().await {
                Ok(status) if status.success() => "Process exited normally".to_string(),
                Ok(status) => format!("Process exited with {status}"),
                Err(e) => format!("Failed waiting for process: {e}"),
            };
            // signal before locking: a concurrent stop holds the lock while
            // it waits for this
            let _ = exit_tx.send(true);
            supervisor.handle_exit(waiter_app_id, instance, message).await;
        });

        Ok(ProcessRecord {
            app_id: app_id.to_string(),
            exec_path: exec_path.to_path_buf(),
            env: env.clone(),
            pid,
            started_at: Utc::now(),
            restarts,
            status: ProcessStatus::Running,
            instance,
            exited: exit_rx,
        })
    }

    /// Crash path shared by the waiter and the sweep
    fn handle_exit(&self, app_id: String, instance: u64, message: String) -> BoxFuture<'static, ()> {
        let supervisor = self.clone();
        async move { supervisor.recover(app_id, instance, message).await }.boxed()
    }

    async fn recover(&self, app_id: String, instance: u64, message: String) {
        let restarts = {
            let mut procs = self.inner.procs.write().await;
            let Some(record) = procs.get_mut(&app_id) else {
                return;
            };
            if record.instance != instance || record.status != ProcessStatus::Running {
                // stopped on purpose, or already handled
                return;
            }
            record.status = ProcessStatus::Crashed;
            record.restarts
        };

        warn!(app_id = %app_id, "App crashed: {}", message);
        self.inner
            .bus
            .publish(Event::new(EventType::AppFailed, &app_id, message.clone()));

        let max_restarts = self.inner.options.max_restarts;
        if restarts >= max_restarts {
            error!(
                app_id = %app_id,
                "App exceeded maximum restart attempts ({})",
                max_restarts
            );
            return;
        }

        info!(
            app_id = %app_id,
            "Restarting app (attempt {}/{})...",
            restarts + 1,
            max_restarts
        );
        tokio::time::sleep(self.inner.options.restart_delay).await;

        let mut procs = self.inner.procs.write().await;
        let Some(record) = procs.get(&app_id) else {
            return;
        };
        if record.instance != instance || record.status != ProcessStatus::Crashed {
            debug!(app_id = %app_id, "App changed during restart delay, skipping restart");
            return;
        }

        let (exec_path, env) = (record.exec_path.clone(), record.env.clone());
        match self.spawn(&app_id, &exec_path, &env, restarts + 1).await {
            Ok(record) => {
                procs.insert(app_id, record);
            }
            Err(e) => {
                error!(app_id = %app_id, "Failed to restart app: {}", e);
            }
        }
    }
}
