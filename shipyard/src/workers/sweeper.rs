//! Periodic liveness sweep over supervised processes

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

/// Sweeper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Run the sweeper until `shutdown_signal` resolves
pub async fn run<S, F>(
    options: &Options,
    supervisor: &Supervisor,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(interval = ?options.interval, "Sweeper worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Sweeper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let dead = supervisor.check_processes().await;
        if dead > 0 {
            warn!(dead, "Sweep found exited processes");
        } else {
            debug!("Sweep found every running process alive");
        }
    }
}
