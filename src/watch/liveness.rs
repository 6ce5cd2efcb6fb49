use super::{WatchContext, WatchError, WatchTarget, Watcher};
use crate::alert::{AlertEvent, AlertKind};
use crate::config::{LivenessSettings, ProcessRef};
use crate::probe::ProcessProbe;
use async_trait::async_trait;
use std::sync::Arc;

/// Polls for a process and fires exactly once when it is gone.
pub struct LivenessWatcher {
    settings: LivenessSettings,
    probe: Arc<dyn ProcessProbe>,
}

impl LivenessWatcher {
    pub fn new(settings: LivenessSettings, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { settings, probe }
    }

    async fn is_alive(&self) -> std::io::Result<bool> {
        match &self.settings.process {
            ProcessRef::Pid(pid) => self.probe.exists(*pid).await,
            ProcessRef::Name(name) => self.probe.find_by_name(name).await,
        }
    }

    fn gone_event(&self) -> AlertEvent {
        let process = &self.settings.process;
        let event = AlertEvent::new(
            AlertKind::Liveness,
            process.to_string(),
            format!("{process} is no longer running"),
        );
        match process {
            ProcessRef::Pid(pid) => event.with_detail("pid", *pid),
            ProcessRef::Name(name) => event.with_detail("name", name.as_str()),
        }
    }
}

#[async_trait]
impl Watcher for LivenessWatcher {
    fn target(&self) -> WatchTarget {
        WatchTarget::Process(self.settings.process.clone())
    }

    fn name(&self) -> String {
        format!("liveness {}", self.settings.process)
    }

    async fn run(&mut self, mut ctx: WatchContext) -> Result<(), WatchError> {
        let process = self.settings.process.clone();
        tracing::info!(
            process = %process,
            poll_secs = self.settings.poll_interval.as_secs(),
            "liveness watch started"
        );

        loop {
            match self.is_alive().await {
                Ok(true) => tracing::debug!(process = %process, "still running"),
                Ok(false) => {
                    ctx.emit(self.gone_event());
                    tracing::info!(process = %process, "process gone, liveness watch finished");
                    return Ok(());
                }
                // A failed query says nothing about the process; ask again next tick
                Err(e) => tracing::warn!(process = %process, error = %e, "liveness probe failed"),
            }

            if !ctx.sleep(self.settings.poll_interval).await {
                tracing::info!(process = %process, "liveness watch stopped");
                return Ok(());
            }
        }
    }
}
