//! Supervision loop keeping every monitor alive until shutdown
//!
//! Each monitor runs in its own task and is restarted after a fixed backoff
//! whenever its probe session ends, until a single cancellation watcher
//! (OS interrupt or caller-supplied shutdown signal) latches the shared
//! restart flag and stops every monitor. The loop returns only once every
//! monitor task has been joined.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};

use crate::monitor::Monitor;

/// Pause between probe sessions of one monitor
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// How a supervision run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An OS interrupt asked the process to exit. Distinguished so callers
    /// can treat it as a clean exit rather than an error.
    Interrupted,

    /// The caller's shutdown signal fired.
    Cancelled,
}

/// Run all monitors under cooperative restart semantics until cancelled.
///
/// Blocks until every monitor has terminated. A failing monitor never
/// terminates the loop or affects its siblings; its error is logged and it
/// is restarted after the backoff.
#[instrument(skip_all, fields(monitors = monitors.len()))]
pub async fn run_supervision(
    shutdown: watch::Receiver<bool>,
    monitors: Vec<Monitor>,
) -> anyhow::Result<Outcome> {
    let monitors: Vec<Arc<Monitor>> = monitors.into_iter().map(Arc::new).collect();

    // Single writer (the watcher), lock-free reads on the restart-check
    // path. One-way transition: once false, never true again.
    let restart = Arc::new(AtomicBool::new(true));

    let mut tasks = Vec::with_capacity(monitors.len());
    for monitor in &monitors {
        tasks.push(tokio::spawn(monitor_loop(
            monitor.clone(),
            restart.clone(),
        )));
    }

    let watcher = tokio::spawn(watch_for_shutdown(shutdown, monitors, restart));

    for task in tasks {
        if let Err(e) = task.await {
            error!("monitor task panicked: {e}");
        }
    }

    let outcome = watcher.await?;
    info!("all monitors terminated");
    Ok(outcome)
}

/// Restart cycle for one monitor: Running until the restart flag drops.
async fn monitor_loop(monitor: Arc<Monitor>, restart: Arc<AtomicBool>) {
    loop {
        if let Err(e) = monitor.start().await {
            error!(monitor = %monitor.name(), "{e}");
        }

        if !restart.load(Ordering::SeqCst) {
            debug!(monitor = %monitor.name(), "exiting monitor");
            break;
        }

        sleep(RESTART_BACKOFF).await;
        info!(monitor = %monitor.name(), "restarting monitor");
    }
}

/// Waits for the first cancellation trigger, then latches the restart flag
/// and stops every monitor. The flag flips before any monitor is asked to
/// stop, so a session that ends from here on is never restarted.
async fn watch_for_shutdown(
    mut shutdown: watch::Receiver<bool>,
    monitors: Vec<Arc<Monitor>>,
    restart: Arc<AtomicBool>,
) -> Outcome {
    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received interrupt signal, exiting");
            Outcome::Interrupted
        }

        _ = shutdown.changed() => {
            info!("shutdown requested, exiting");
            Outcome::Cancelled
        }
    };

    restart.store(false, Ordering::SeqCst);
    for monitor in &monitors {
        debug!(monitor = %monitor.name(), "stopping monitor");
        monitor.stop().await;
    }

    outcome
}
