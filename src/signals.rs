/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) or SIGTERM: stop every watcher at its next sleep.
/// Second SIGINT: exit immediately.
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Receiving side of the stop signal, cloned into every watcher.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a stop signal. Sending `true` stops every clone of the [`Shutdown`].
pub fn channel() -> (watch::Sender<bool>, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (tx, Shutdown { rx })
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested. Never resolves if the
    /// sender is dropped without requesting one.
    pub async fn requested(&mut self) {
        loop {
            let stop = *self.rx.borrow_and_update();
            if stop {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration`. Returns `false` if interrupted by a stop request.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.requested() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Install SIGINT/SIGTERM handlers and return the stop signal they drive.
pub fn install() -> std::io::Result<Shutdown> {
    let (tx, shutdown) = channel();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("SIGINT received, stopping watchers (Ctrl-C again to exit now)");
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, stopping watchers");
            }
        }
        let _ = tx.send(true);

        if sigint.recv().await.is_some() {
            tracing::warn!("second SIGINT, exiting immediately");
            std::process::exit(130);
        }
    });

    Ok(shutdown)
}
