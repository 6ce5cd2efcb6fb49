use crate::alert::AlertEvent;
use crate::context::CallContext;
use crate::dispatch::Dispatcher;
use crate::signals::Shutdown;
use crate::watch::{WatchContext, Watcher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Counters reported when the supervisor exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub fired: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Alerts still queued when a stop was requested.
    pub dropped: usize,
    /// Alerts discarded because the queue was full.
    pub overflowed: usize,
}

pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// Runs every watcher as its own task and forwards their alerts to the
/// dispatcher from a single loop.
pub struct Supervisor {
    watchers: Vec<Box<dyn Watcher>>,
    dispatcher: Dispatcher,
    context: CallContext,
    queue_size: usize,
}

impl Supervisor {
    pub fn new(dispatcher: Dispatcher, context: CallContext) -> Self {
        Self {
            watchers: Vec::new(),
            dispatcher,
            context,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }

    /// Cap on alerts waiting for delivery. Watchers never block on a full
    /// queue; the newest alerts are dropped instead.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    pub fn add(&mut self, watcher: Box<dyn Watcher>) {
        self.watchers.push(watcher);
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    /// Run until every watcher has finished or `shutdown` fires.
    pub async fn run(self, shutdown: Shutdown) -> RunSummary {
        let (tx, mut rx) = mpsc::channel::<AlertEvent>(self.queue_size);
        let overflow = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for mut watcher in self.watchers {
            let name = watcher.name();
            let target = watcher.target();
            let ctx = WatchContext::new(tx.clone(), Arc::clone(&overflow), shutdown.clone());
            let span = tracing::info_span!("watch", watcher = %name);
            tasks.spawn(
                async move {
                    if let Err(e) = watcher.run(ctx).await {
                        tracing::error!(resource = %target, error = %e, "watcher failed");
                    }
                }
                .instrument(span),
            );
        }
        // The channel closes once the last watcher returns
        drop(tx);

        tracing::info!(
            watchers = tasks.len(),
            queue_size = self.queue_size,
            endpoint = %self.dispatcher.endpoint(),
            "supervisor started"
        );

        let mut summary = RunSummary::default();
        let mut stop = shutdown.clone();
        loop {
            let event = tokio::select! {
                _ = stop.requested() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            summary.fired += 1;
            deliver(&self.dispatcher, &self.context, event, &mut summary).await;
        }

        while rx.try_recv().is_ok() {
            summary.dropped += 1;
        }
        if summary.dropped > 0 {
            tracing::warn!(dropped = summary.dropped, "stopping with undelivered alerts");
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "watcher task panicked");
            }
        }

        summary.overflowed = overflow.load(Ordering::Relaxed);
        if summary.overflowed > 0 {
            tracing::warn!(
                overflowed = summary.overflowed,
                "alerts were dropped because the queue was full"
            );
        }

        tracing::info!(
            fired = summary.fired,
            delivered = summary.delivered,
            failed = summary.failed,
            "supervisor stopped"
        );
        summary
    }
}

async fn deliver(
    dispatcher: &Dispatcher,
    context: &CallContext,
    event: AlertEvent,
    summary: &mut RunSummary,
) {
    let target = event.target.clone();
    let payload = event.into_payload(context.clone());
    match dispatcher.dispatch(&payload).await {
        Ok(_) => summary.delivered += 1,
        Err(e) => {
            summary.failed += 1;
            tracing::warn!(
                kind = payload.kind.as_str(),
                resource = %target,
                error = %e,
                "alert delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertKind;
    use crate::config::{LivenessSettings, ProcessRef};
    use crate::dispatch::tests::{api, refused_endpoint, spawn_endpoint, spawn_slow_endpoint};
    use crate::probe::fake::ScriptedProbe;
    use crate::signals;
    use crate::watch::{liveness::LivenessWatcher, WatchError, WatchTarget};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;

    /// Emits `count` alerts, then returns.
    struct Burst {
        count: usize,
    }

    #[async_trait]
    impl Watcher for Burst {
        fn target(&self) -> WatchTarget {
            WatchTarget::Path("/tmp/burst".into())
        }

        fn name(&self) -> String {
            "burst".to_string()
        }

        async fn run(&mut self, ctx: WatchContext) -> Result<(), WatchError> {
            for i in 0..self.count {
                ctx.emit(AlertEvent::new(AlertKind::Heartbeat, "/tmp/burst", format!("burst {i}")));
            }
            Ok(())
        }
    }

    /// Sleeps for an hour unless stopped.
    struct Sleeper;

    #[async_trait]
    impl Watcher for Sleeper {
        fn target(&self) -> WatchTarget {
            WatchTarget::Path("/tmp/sleeper".into())
        }

        fn name(&self) -> String {
            "sleeper".to_string()
        }

        async fn run(&mut self, mut ctx: WatchContext) -> Result<(), WatchError> {
            ctx.sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Watcher for Broken {
        fn target(&self) -> WatchTarget {
            WatchTarget::Path("/nonexistent".into())
        }

        fn name(&self) -> String {
            "broken".to_string()
        }

        async fn run(&mut self, _ctx: WatchContext) -> Result<(), WatchError> {
            Err(WatchError::NotWatchable {
                path: "/nonexistent".into(),
            })
        }
    }

    fn context() -> CallContext {
        CallContext {
            hostname: "box".to_string(),
            ip: "10.1.2.3".to_string(),
            user: "ops".to_string(),
            cmdline: "warden watch".to_string(),
        }
    }

    #[tokio::test]
    async fn test_alerts_reach_the_endpoint() {
        let (url, seen) = spawn_endpoint(StatusCode::OK).await;
        let mut supervisor = Supervisor::new(Dispatcher::new(&api(&url)).unwrap(), context());
        supervisor.add(Box::new(Burst { count: 2 }));
        let (_stop, shutdown) = signals::channel();

        let summary = supervisor.run(shutdown).await;
        assert_eq!(summary.fired, 2);
        assert_eq!(summary.delivered, 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].body["type"], "heartbeat");
        assert_eq!(seen[0].body["source"]["hostname"], "box");
        assert_eq!(seen[0].body["body"]["message"], "burst 0");
        assert_eq!(seen[1].body["body"]["message"], "burst 1");
    }

    #[tokio::test]
    async fn test_delivery_failures_do_not_stop_watching() {
        let dispatcher = Dispatcher::new(&api(&refused_endpoint())).unwrap();
        let mut supervisor = Supervisor::new(dispatcher, context());
        supervisor.add(Box::new(Burst { count: 3 }));
        let (_stop, shutdown) = signals::channel();

        let summary = supervisor.run(shutdown).await;
        assert_eq!(summary.fired, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.delivered, 0);
    }

    #[tokio::test]
    async fn test_server_errors_are_counted_as_failures() {
        let (url, seen) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;
        let mut supervisor = Supervisor::new(Dispatcher::new(&api(&url)).unwrap(), context());
        supervisor.add(Box::new(Burst { count: 1 }));
        let (_stop, shutdown) = signals::channel();

        let summary = supervisor.run(shutdown).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backlog_is_capped_behind_slow_endpoint() {
        let (url, seen) = spawn_slow_endpoint(StatusCode::OK, Duration::from_millis(50)).await;
        let mut supervisor = Supervisor::new(Dispatcher::new(&api(&url)).unwrap(), context())
            .with_queue_size(4);
        supervisor.add(Box::new(Burst { count: 1000 }));
        let (_stop, shutdown) = signals::channel();

        let summary = tokio::time::timeout(Duration::from_secs(10), supervisor.run(shutdown))
            .await
            .expect("backlog was not capped");
        assert_eq!(summary.fired + summary.overflowed, 1000);
        assert!(summary.fired <= 5, "fired {}", summary.fired);
        assert_eq!(summary.delivered, summary.fired);
        assert_eq!(seen.lock().unwrap().len(), summary.fired);
        // Oldest alerts are kept
        assert_eq!(seen.lock().unwrap()[0].body["body"]["message"], "burst 0");
    }

    #[tokio::test]
    async fn test_stop_ends_sleeping_watchers_promptly() {
        let dispatcher = Dispatcher::new(&api(&refused_endpoint())).unwrap();
        let mut supervisor = Supervisor::new(dispatcher, context());
        supervisor.add(Box::new(Sleeper));
        supervisor.add(Box::new(Sleeper));
        let (stop, shutdown) = signals::channel();

        let handle = tokio::spawn(supervisor.run(shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    #[tokio::test]
    async fn test_failed_watcher_does_not_affect_others() {
        let (url, seen) = spawn_endpoint(StatusCode::OK).await;
        let mut supervisor = Supervisor::new(Dispatcher::new(&api(&url)).unwrap(), context());
        supervisor.add(Box::new(Broken));
        supervisor.add(Box::new(Burst { count: 1 }));
        assert_eq!(supervisor.len(), 2);
        let (_stop, shutdown) = signals::channel();

        let summary = supervisor.run(shutdown).await;
        assert_eq!(summary.delivered, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_liveness_alert_end_to_end() {
        let (url, seen) = spawn_endpoint(StatusCode::OK).await;
        let mut supervisor = Supervisor::new(Dispatcher::new(&api(&url)).unwrap(), context());
        supervisor.add(Box::new(LivenessWatcher::new(
            LivenessSettings {
                process: ProcessRef::Pid(31337),
                poll_interval: Duration::from_millis(10),
            },
            Arc::new(ScriptedProbe::alive(&[true, false])),
        )));
        let (_stop, shutdown) = signals::channel();

        let summary = supervisor.run(shutdown).await;
        assert_eq!(summary.delivered, 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].body["type"], "liveness");
        assert_eq!(seen[0].body["status"], "success");
        assert_eq!(seen[0].body["body"]["pid"], 31337);
        assert_eq!(seen[0].body["body"]["target"], "pid 31337");
    }
}
