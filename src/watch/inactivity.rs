/// Inactivity detection: alert when a file or directory stops changing.
///
/// Ticks once per `interval`. While the target is stale each tick fires one
/// alert, up to `num_checks`; after that the detector stays silent until
/// the target changes again.
use super::{WatchContext, WatchError, WatchTarget, Watcher};
use crate::alert::{AlertEvent, AlertKind};
use crate::config::InactivitySettings;
use async_trait::async_trait;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Changed recently (or just now).
    Fresh,
    /// Unchanged for `idle`; fire alert number `alert` (1-based).
    Stale { alert: u32, idle: Duration },
    /// Stale, but `num_checks` alerts have already fired.
    Exhausted,
}

/// The alert-volume state machine, independent of any clock or filesystem.
#[derive(Debug)]
pub struct InactivityTracker {
    interval: Duration,
    num_checks: u32,
    last_mtime: SystemTime,
    alerts: u32,
}

impl InactivityTracker {
    pub fn new(interval: Duration, num_checks: u32, mtime: SystemTime) -> Self {
        Self {
            interval,
            num_checks,
            last_mtime: mtime,
            alerts: 0,
        }
    }

    /// Feed the target's current modification time at wall-clock `now`.
    pub fn observe(&mut self, mtime: SystemTime, now: SystemTime) -> Freshness {
        if mtime != self.last_mtime {
            self.last_mtime = mtime;
            self.alerts = 0;
            return Freshness::Fresh;
        }

        // A modification time in the future (clock skew) counts as fresh
        let idle = now.duration_since(self.last_mtime).unwrap_or(Duration::ZERO);
        if idle < self.interval {
            return Freshness::Fresh;
        }
        if self.alerts >= self.num_checks {
            return Freshness::Exhausted;
        }
        self.alerts += 1;
        Freshness::Stale {
            alert: self.alerts,
            idle,
        }
    }

    pub fn alerts_fired(&self) -> u32 {
        self.alerts
    }
}

/// Most recent modification time of `path`.
///
/// For a directory: the newest mtime among its immediate entries, or the
/// directory's own mtime when it is empty.
pub fn latest_mtime(path: &Path) -> std::io::Result<SystemTime> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return meta.modified();
    }

    let mut latest: Option<SystemTime> = None;
    for entry in std::fs::read_dir(path)?.flatten() {
        // Entries can vanish between listing and stat
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            latest = Some(latest.map_or(modified, |l| l.max(modified)));
        }
    }
    match latest {
        Some(t) => Ok(t),
        None => meta.modified(),
    }
}

pub struct InactivityDetector {
    settings: InactivitySettings,
}

impl InactivityDetector {
    pub fn new(settings: InactivitySettings) -> Self {
        Self { settings }
    }

    fn read_mtime(&self) -> Option<SystemTime> {
        match latest_mtime(&self.settings.path) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(
                    path = %self.settings.path.display(),
                    error = %e,
                    "target unavailable, will retry next tick"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Watcher for InactivityDetector {
    fn target(&self) -> WatchTarget {
        WatchTarget::Path(self.settings.path.clone())
    }

    fn name(&self) -> String {
        format!("inactivity {}", self.settings.path.display())
    }

    async fn run(&mut self, mut ctx: WatchContext) -> Result<(), WatchError> {
        let s = &self.settings;
        tracing::info!(
            path = %s.path.display(),
            interval_secs = s.interval.as_secs(),
            num_checks = s.num_checks,
            "inactivity watch started"
        );

        let mut tracker = self
            .read_mtime()
            .map(|t| InactivityTracker::new(s.interval, s.num_checks, t));

        while ctx.sleep(s.interval).await {
            let Some(mtime) = self.read_mtime() else {
                continue;
            };
            let tracker = match &mut tracker {
                Some(tracker) => tracker,
                None => {
                    // Target appeared after startup: this is its first observation
                    tracker = Some(InactivityTracker::new(s.interval, s.num_checks, mtime));
                    continue;
                }
            };

            match tracker.observe(mtime, SystemTime::now()) {
                Freshness::Fresh => {
                    tracing::debug!(path = %s.path.display(), "target is fresh");
                }
                Freshness::Stale { alert, idle } => {
                    ctx.emit(
                        AlertEvent::new(
                            AlertKind::Heartbeat,
                            s.path.display().to_string(),
                            format!(
                                "{} has not changed for {}s",
                                s.path.display(),
                                idle.as_secs()
                            ),
                        )
                        .with_detail("idle_secs", idle.as_secs())
                        .with_detail("alert", alert)
                        .with_detail("max_alerts", s.num_checks),
                    );
                }
                Freshness::Exhausted => {
                    tracing::debug!(
                        path = %s.path.display(),
                        alerts = tracker.alerts_fired(),
                        "still stale, alert limit reached"
                    );
                }
            }
        }

        tracing::info!(path = %s.path.display(), "inactivity watch stopped");
        Ok(())
    }
}
