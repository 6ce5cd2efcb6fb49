/// Stalled-process detection.
///
/// A process that sits in `S+` (sleeping, foreground process group) for
/// several consecutive polls is most likely parked at an interactive prompt
/// such as a debugger breakpoint.
use super::{WatchContext, WatchError, WatchTarget, Watcher};
use crate::alert::{AlertEvent, AlertKind};
use crate::config::{ProcessRef, StalledSettings};
use crate::probe::{is_parked, is_zombie, ProcessProbe};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Not parked; the streak is cleared.
    Running,
    /// Parked, `streak` consecutive times so far.
    Parked { streak: u32 },
    /// Parked for the configured number of polls. The streak starts over.
    Stalled,
}

/// Counts consecutive parked observations.
#[derive(Debug)]
pub struct StallTracker {
    num_checks: u32,
    streak: u32,
}

impl StallTracker {
    pub fn new(num_checks: u32) -> Self {
        Self {
            num_checks,
            streak: 0,
        }
    }

    pub fn observe(&mut self, state: &str) -> Observation {
        if !is_parked(state) {
            self.streak = 0;
            return Observation::Running;
        }
        self.streak += 1;
        if self.streak >= self.num_checks {
            self.streak = 0;
            Observation::Stalled
        } else {
            Observation::Parked {
                streak: self.streak,
            }
        }
    }
}

pub struct StalledProcessWatcher {
    settings: StalledSettings,
    probe: Arc<dyn ProcessProbe>,
}

impl StalledProcessWatcher {
    pub fn new(settings: StalledSettings, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { settings, probe }
    }
}

#[async_trait]
impl Watcher for StalledProcessWatcher {
    fn target(&self) -> WatchTarget {
        WatchTarget::Process(ProcessRef::Pid(self.settings.pid))
    }

    fn name(&self) -> String {
        format!("stalled pid {}", self.settings.pid)
    }

    async fn run(&mut self, mut ctx: WatchContext) -> Result<(), WatchError> {
        let s = &self.settings;
        let mut tracker = StallTracker::new(s.num_checks);
        let mut cooling_down = false;
        tracing::info!(
            pid = s.pid,
            check_secs = s.check_interval.as_secs(),
            num_checks = s.num_checks,
            "stalled-process watch started"
        );

        loop {
            if cooling_down {
                tracing::debug!(pid = s.pid, pause_secs = s.long_pause.as_secs(), "cooling down");
                if !ctx.sleep(s.long_pause).await {
                    break;
                }
                cooling_down = false;
            }

            match self.probe.scheduler_state(s.pid).await {
                Ok(None) => {
                    tracing::info!(pid = s.pid, "process can no longer be queried, watch finished");
                    return Ok(());
                }
                Ok(Some(state)) if is_zombie(&state) => {
                    tracing::info!(pid = s.pid, state = %state, "process has exited, watch finished");
                    return Ok(());
                }
                Err(e) => tracing::warn!(pid = s.pid, error = %e, "state query failed"),
                Ok(Some(state)) => {
                    let observation = tracker.observe(&state);
                    match observation {
                        Observation::Running => {}
                        Observation::Parked { streak } => {
                            tracing::debug!(pid = s.pid, state = %state, streak, "process parked");
                        }
                        Observation::Stalled => {
                            ctx.emit(
                                AlertEvent::new(
                                    AlertKind::Stalled,
                                    format!("pid {}", s.pid),
                                    format!(
                                        "pid {} parked in state {} for {} consecutive checks",
                                        s.pid, state, s.num_checks
                                    ),
                                )
                                .with_detail("pid", s.pid)
                                .with_detail("state", state.as_str())
                                .with_detail("checks", s.num_checks),
                            );
                            cooling_down = true;
                        }
                    }
                    if observation != Observation::Running && !ctx.sleep(s.throttle).await {
                        break;
                    }
                }
            }

            if !ctx.sleep(s.check_interval).await {
                break;
            }
        }

        tracing::info!(pid = s.pid, "stalled-process watch stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::ScriptedProbe;
    use crate::watch::testing;
    use std::time::Duration;

    fn settings() -> StalledSettings {
        StalledSettings {
            pid: 77,
            check_interval: Duration::from_secs(5),
            num_checks: 3,
            throttle: Duration::from_secs(1),
            long_pause: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_tracker_fires_on_third_parked_poll() {
        let mut tracker = StallTracker::new(3);
        assert_eq!(tracker.observe("S+"), Observation::Parked { streak: 1 });
        assert_eq!(tracker.observe("Ss+"), Observation::Parked { streak: 2 });
        assert_eq!(tracker.observe("S+"), Observation::Stalled);
        // Streak starts over after firing
        assert_eq!(tracker.observe("S+"), Observation::Parked { streak: 1 });
    }

    #[test]
    fn test_running_clears_streak() {
        let mut tracker = StallTracker::new(3);
        tracker.observe("S+");
        tracker.observe("S+");
        assert_eq!(tracker.observe("R+"), Observation::Running);
        assert_eq!(tracker.observe("S+"), Observation::Parked { streak: 1 });
        assert_eq!(tracker.observe("S"), Observation::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_then_long_pause_then_exit() {
        let probe = Arc::new(ScriptedProbe::states(&[
            Some("S+"),
            Some("S+"),
            Some("S+"),
            None,
        ]));
        let mut w = StalledProcessWatcher::new(settings(), probe.clone());
        let (ctx, mut rx, _stop) = testing::context();

        w.run(ctx).await.unwrap();

        let events = testing::drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertKind::Stalled);
        assert_eq!(events[0].detail["state"], "S+");

        let polls = probe.polls.lock().unwrap().clone();
        assert_eq!(polls.len(), 4);
        // Parked polls are spaced by throttle + interval
        assert_eq!(polls[1] - polls[0], Duration::from_secs(6));
        // After the alert: throttle + interval + long pause
        assert_eq!(polls[3] - polls[2], Duration::from_secs(306));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_in_between_prevents_alert() {
        let probe = Arc::new(ScriptedProbe::states(&[
            Some("S+"),
            Some("S+"),
            Some("R+"),
            Some("S+"),
            Some("S+"),
            None,
        ]));
        let mut w = StalledProcessWatcher::new(settings(), probe.clone());
        let (ctx, mut rx, _stop) = testing::context();

        w.run(ctx).await.unwrap();

        assert!(testing::drain(&mut rx).is_empty());
        assert_eq!(probe.poll_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unqueryable_process_exits_silently() {
        let probe = Arc::new(ScriptedProbe::states(&[None]));
        let mut w = StalledProcessWatcher::new(settings(), probe.clone());
        let (ctx, mut rx, _stop) = testing::context();

        w.run(ctx).await.unwrap();

        assert!(testing::drain(&mut rx).is_empty());
        assert_eq!(probe.poll_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zombie_ends_watch_without_alert() {
        let probe = Arc::new(ScriptedProbe::states(&[
            Some("S+"),
            Some("S+"),
            Some("Z+"),
            Some("S+"),
        ]));
        let mut w = StalledProcessWatcher::new(settings(), probe.clone());
        let (ctx, mut rx, _stop) = testing::context();

        w.run(ctx).await.unwrap();

        assert!(testing::drain(&mut rx).is_empty());
        assert_eq!(probe.poll_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_long_pause() {
        let probe = Arc::new(ScriptedProbe::states(&[Some("S+")]));
        let mut w = StalledProcessWatcher::new(settings(), probe.clone());
        let (ctx, mut rx, stop) = testing::context();
        let handle = tokio::spawn(async move { w.run(ctx).await });

        tokio::time::sleep(Duration::from_secs(60)).await;
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(testing::drain(&mut rx).len(), 1);
        assert_eq!(probe.poll_count(), 3);
    }
}
