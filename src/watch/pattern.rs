/// Pattern watcher: scan lines appended to a file (or to every regular file
/// in a directory) for substrings, one alert per (line, pattern) match.
///
/// Change notifications come from `notify`; a poll tick runs alongside so a
/// missed or unsupported notification only delays a match by one interval.
use super::{WatchContext, WatchError, WatchTarget, Watcher};
use crate::alert::{AlertEvent, AlertKind};
use crate::config::PatternSettings;
use crate::redact::redact;
use crate::tail::Cursors;
use async_trait::async_trait;
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode,
    Watcher as _,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

const EVENT_BUFFER: usize = 256;

/// Patterns contained in `line`, in configured order.
pub fn matching_patterns<'a>(line: &'a str, patterns: &'a [String]) -> impl Iterator<Item = &'a str> {
    patterns
        .iter()
        .map(String::as_str)
        .filter(move |p| line.contains(p))
}

#[derive(Debug, Clone)]
enum Root {
    File(PathBuf),
    Directory(PathBuf),
}

impl Root {
    fn resolve(path: &Path) -> Result<Self, WatchError> {
        let canonical = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WatchError::NotWatchable {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(WatchError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let meta = std::fs::metadata(&canonical).map_err(|e| WatchError::Io {
            path: canonical.clone(),
            source: e,
        })?;
        if meta.is_file() {
            Ok(Root::File(canonical))
        } else if meta.is_dir() {
            Ok(Root::Directory(canonical))
        } else {
            Err(WatchError::NotWatchable { path: canonical })
        }
    }

    /// Directory handed to `notify`. A single file is watched through its
    /// parent so that replacing the file is still seen.
    fn subscription_dir(&self) -> &Path {
        match self {
            Root::File(file) => file.parent().unwrap_or(file.as_path()),
            Root::Directory(dir) => dir.as_path(),
        }
    }

    /// Map a notified path to the file to read, if it is one we track.
    fn candidate(&self, path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?;
        match self {
            Root::File(file) => (file.file_name() == Some(name)).then(|| file.clone()),
            Root::Directory(dir) => Some(dir.join(name)),
        }
    }

    /// Every file that should be read on a poll tick.
    fn files(&self) -> Vec<PathBuf> {
        match self {
            Root::File(file) => vec![file.clone()],
            Root::Directory(dir) => regular_files(dir),
        }
    }
}

fn regular_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "cannot list directory");
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

fn subscribe(
    dir: &Path,
    sender: mpsc::Sender<notify::Result<Event>>,
    poll_interval: Duration,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sender.blocking_send(res);
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

pub struct PatternWatcher {
    settings: PatternSettings,
    cursors: Cursors,
}

impl PatternWatcher {
    pub fn new(settings: PatternSettings) -> Self {
        Self {
            settings,
            cursors: Cursors::new(),
        }
    }

    /// Resolve the root and place cursors at the end of existing files.
    fn prime(&mut self) -> Result<Root, WatchError> {
        let root = Root::resolve(&self.settings.path)?;
        for file in root.files() {
            if let Err(e) = self.cursors.track_from_end(&file) {
                tracing::warn!(path = %file.display(), error = %e, "cannot open log file");
            }
        }
        Ok(root)
    }

    /// Read whatever was appended to `file` and emit an alert per match.
    fn scan(&mut self, file: &Path, ctx: &WatchContext) {
        let chunk = match self.cursors.read_new(file) {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.cursors.forget(file) {
                    tracing::warn!(path = %file.display(), "log file disappeared");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "cannot read log file");
                return;
            }
        };

        if let Some(previous) = &chunk.renamed_from {
            tracing::debug!(from = %previous.display(), to = %file.display(), "log file renamed");
        }
        if chunk.binary {
            tracing::debug!(path = %file.display(), "binary file, not scanned");
            return;
        }
        if chunk.first_read {
            tracing::debug!(path = %file.display(), "new log file, read from start");
        }
        if !chunk.lines.is_empty() {
            tracing::debug!(
                path = %file.display(),
                lines = chunk.lines.len(),
                truncated = chunk.truncated,
                offset = chunk.offset,
                "read new lines"
            );
        }

        for line in &chunk.lines {
            for pattern in matching_patterns(line, &self.settings.patterns) {
                let shown = if self.settings.redact {
                    redact(line)
                } else {
                    line.as_str().into()
                };
                ctx.emit(
                    AlertEvent::new(
                        AlertKind::Pattern,
                        file.display().to_string(),
                        format!("pattern '{pattern}' detected"),
                    )
                    .with_detail("pattern", pattern)
                    .with_detail("line", shown.into_owned()),
                );
            }
        }
    }

    fn handle_event(&mut self, root: &Root, event: notify::Result<Event>, ctx: &WatchContext) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "file notification error");
                return;
            }
        };
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in &event.paths {
                    if let Some(file) = root.candidate(path) {
                        if file.is_file() {
                            self.scan(&file, ctx);
                        }
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    if let Some(file) = root.candidate(path) {
                        if self.cursors.forget(&file) {
                            tracing::debug!(path = %file.display(), "log file removed");
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

enum Step {
    Stop,
    Notified(notify::Result<Event>),
    Tick,
}

#[async_trait]
impl Watcher for PatternWatcher {
    fn target(&self) -> WatchTarget {
        WatchTarget::Path(self.settings.path.clone())
    }

    fn name(&self) -> String {
        format!("pattern {}", self.settings.path.display())
    }

    async fn run(&mut self, mut ctx: WatchContext) -> Result<(), WatchError> {
        let root = self.prime()?;
        let poll_interval = self.settings.poll_interval;

        let (tx, mut events) = mpsc::channel(EVENT_BUFFER);
        // Dropping the subscription at return releases the OS watch
        let _subscription = match subscribe(root.subscription_dir(), tx, poll_interval) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(
                    path = %root.subscription_dir().display(),
                    error = %e,
                    "file notifications unavailable, polling only"
                );
                None
            }
        };

        tracing::info!(
            path = %self.settings.path.display(),
            patterns = self.settings.patterns.len(),
            files = self.cursors.tracked_count(),
            "pattern watch started"
        );

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                _ = ctx.stopped() => Step::Stop,
                Some(event) = events.recv() => Step::Notified(event),
                _ = ticker.tick() => Step::Tick,
            };

            match step {
                Step::Stop => break,
                Step::Notified(event) => self.handle_event(&root, event, &ctx),
                Step::Tick => {
                    let files = root.files();
                    let dropped = self.cursors.retain_live(&files);
                    if dropped > 0 {
                        tracing::debug!(dropped, "forgot cursors of vanished files");
                    }
                    for file in &files {
                        if ctx.is_stopped() {
                            break;
                        }
                        self.scan(file, &ctx);
                    }
                }
            }
        }

        tracing::info!(path = %self.settings.path.display(), "pattern watch stopped");
        Ok(())
    }
}
