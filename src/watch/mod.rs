pub mod inactivity;
pub mod liveness;
pub mod pattern;
pub mod stalled;

use crate::alert::AlertEvent;
use crate::config::{ProcessRef, WatchPlan};
use crate::probe::ProcessProbe;
use crate::signals::Shutdown;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

/// What a watcher observes. Fixed for the lifetime of the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Path(PathBuf),
    Process(ProcessRef),
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchTarget::Path(path) => write!(f, "{}", path.display()),
            WatchTarget::Process(process) => write!(f, "{process}"),
        }
    }
}

/// Errors that end a watcher before it could start watching.
#[derive(Debug)]
pub enum WatchError {
    /// The target path is neither a file nor a directory.
    NotWatchable { path: PathBuf },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::NotWatchable { path } => {
                write!(f, "{} is neither a file nor a directory", path.display())
            }
            WatchError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::NotWatchable { .. } => None,
            WatchError::Io { source, .. } => Some(source),
        }
    }
}

/// Everything a running watcher gets from its supervisor.
pub struct WatchContext {
    alerts: mpsc::Sender<AlertEvent>,
    /// Alerts dropped because the queue was full, shared by all watchers.
    overflow: Arc<AtomicUsize>,
    shutdown: Shutdown,
}

impl WatchContext {
    pub fn new(
        alerts: mpsc::Sender<AlertEvent>,
        overflow: Arc<AtomicUsize>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            alerts,
            overflow,
            shutdown,
        }
    }

    /// Hand an alert to the dispatch loop. Never blocks: when the queue is
    /// full the alert is dropped and counted.
    pub fn emit(&self, event: AlertEvent) {
        tracing::info!(
            kind = event.kind.as_str(),
            resource = %event.target,
            message = %event.message,
            "alert fired"
        );
        match self.alerts.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                // Warn on the 1st, 2nd, 4th, 8th... drop
                if dropped.is_power_of_two() {
                    tracing::warn!(
                        dropped,
                        resource = %event.target,
                        "alert queue full, dropping alerts"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("alert channel closed, dropping alert");
            }
        }
    }

    /// Sleep between ticks. Returns `false` when the watcher should stop.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.shutdown.sleep(duration).await
    }

    pub async fn stopped(&mut self) {
        self.shutdown.requested().await
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_requested()
    }
}

/// A resource watcher. Each one runs as its own task and owns its state.
#[async_trait]
pub trait Watcher: Send {
    fn target(&self) -> WatchTarget;

    /// Short label for logs, e.g. "pattern /var/log/app.log".
    fn name(&self) -> String;

    /// Watch until the target reaches a terminal state or a stop is requested.
    async fn run(&mut self, ctx: WatchContext) -> Result<(), WatchError>;
}

/// Construct the watcher for a validated plan.
pub fn build(plan: WatchPlan, probe: Arc<dyn ProcessProbe>) -> Box<dyn Watcher> {
    match plan {
        WatchPlan::Pattern(s) => Box::new(pattern::PatternWatcher::new(s)),
        WatchPlan::Inactivity(s) => Box::new(inactivity::InactivityDetector::new(s)),
        WatchPlan::Liveness(s) => Box::new(liveness::LivenessWatcher::new(s, probe)),
        WatchPlan::Stalled(s) => Box::new(stalled::StalledProcessWatcher::new(s, probe)),
    }
}
