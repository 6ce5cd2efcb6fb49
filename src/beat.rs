/// Heartbeat writer: appends a timestamped line to a file on an interval.
///
/// Point an inactivity watch at the same file and it fires once the writer
/// (or whatever process embeds it) stops beating.
use crate::signals::Shutdown;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_LINES: usize = 5;

#[derive(Debug)]
pub struct HeartbeatWriter {
    path: PathBuf,
    max_lines: usize,
    lines: usize,
}

impl HeartbeatWriter {
    pub fn new(path: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            path: path.into(),
            max_lines: max_lines.max(1),
            lines: 0,
        }
    }

    /// Append one heartbeat line. Once `max_lines` have been written the
    /// file is emptied first, so it never grows without bound.
    pub fn beat(&mut self) -> std::io::Result<()> {
        let rotate = self.lines >= self.max_lines;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(!rotate)
            .truncate(rotate)
            .open(&self.path)?;
        if rotate {
            self.lines = 0;
        }
        writeln!(
            file,
            "Heartbeat sent at {}",
            chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
        )?;
        self.lines += 1;
        Ok(())
    }

    /// Beat every `interval` until a stop is requested.
    pub async fn run(&mut self, interval: Duration, mut shutdown: Shutdown) -> std::io::Result<()> {
        tracing::info!(
            path = %self.path.display(),
            interval_secs = interval.as_secs(),
            max_lines = self.max_lines,
            "heartbeat writer started"
        );
        loop {
            self.beat()?;
            tracing::debug!(path = %self.path.display(), "heartbeat written");
            if !shutdown.sleep(interval).await {
                break;
            }
        }
        tracing::info!(path = %self.path.display(), "heartbeat writer stopped");
        Ok(())
    }
}
