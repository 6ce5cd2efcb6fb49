/// Run a command under watch and report how it ended.
///
/// The child inherits stdio. When it finishes a `decorator` alert is sent:
/// status `success` on exit 0, `error` otherwise (including spawn failures).
use crate::alert::{AlertKind, AlertPayload};
use crate::context::CallContext;
use crate::dispatch::Dispatcher;
use crate::signals::Shutdown;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{Map, Value};
use std::os::unix::process::ExitStatusExt;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// How a finished command ended.
#[derive(Debug)]
pub struct ExecOutcome {
    /// Exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
    pub pid: u32,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Shell convention: the child's code, or 128 + signal number.
    pub fn shell_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }

    fn failure(&self) -> Option<String> {
        match (self.exit_code, self.signal) {
            (Some(0), _) => None,
            (Some(code), _) => Some(format!("exited with status {code}")),
            (None, Some(signal)) => Some(format!("terminated by signal {signal}")),
            (None, None) => Some("exited abnormally".to_string()),
        }
    }
}

#[derive(Debug)]
pub enum ExecError {
    /// No program was given.
    EmptyCommand,
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Wait { source: std::io::Error },
}

impl ExecError {
    /// Exit code to report when the command never produced one.
    pub fn shell_code(&self) -> i32 {
        match self {
            ExecError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => 127,
            ExecError::Spawn { .. } => 126,
            ExecError::EmptyCommand | ExecError::Wait { .. } => 1,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::EmptyCommand => write!(f, "no command given"),
            ExecError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            ExecError::Wait { source } => {
                write!(f, "failed waiting for command: {}", source)
            }
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::EmptyCommand => None,
            ExecError::Spawn { source, .. } => Some(source),
            ExecError::Wait { source } => Some(source),
        }
    }
}

/// Spawn `command` and wait for it. A stop request is forwarded to the
/// child as SIGTERM; the call still returns only once the child has exited.
pub async fn run_command(
    command: &[String],
    shutdown: &mut Shutdown,
) -> Result<ExecOutcome, ExecError> {
    let (program, args) = command.split_first().ok_or(ExecError::EmptyCommand)?;
    tracing::info!(command = %program, args = ?args, "spawning command");

    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .map_err(|e| ExecError::Spawn {
            program: program.clone(),
            source: e,
        })?;
    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, "command started");

    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = shutdown.requested() => None,
    };
    let status = match finished {
        Some(status) => status,
        None => {
            terminate(pid);
            child.wait().await
        }
    }
    .map_err(|e| ExecError::Wait { source: e })?;

    let outcome = ExecOutcome {
        exit_code: status.code(),
        signal: status.signal(),
        duration: start.elapsed(),
        pid,
    };
    tracing::info!(
        exit_code = ?outcome.exit_code,
        signal = ?outcome.signal,
        duration_ms = outcome.duration.as_millis() as u64,
        "command finished"
    );
    Ok(outcome)
}

fn terminate(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw == 0 {
        return;
    }
    tracing::info!(pid, "stop requested, sending SIGTERM to command");
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "failed to signal command");
    }
}

/// The `decorator` alert describing a command run.
pub fn report(
    command: &[String],
    result: &Result<ExecOutcome, ExecError>,
    source: CallContext,
) -> AlertPayload {
    let mut body = Map::new();
    body.insert("command".to_string(), Value::String(command.join(" ")));

    match result {
        Ok(outcome) => {
            body.insert("pid".to_string(), outcome.pid.into());
            body.insert("exit_code".to_string(), outcome.exit_code.into());
            if let Some(signal) = outcome.signal {
                body.insert("signal".to_string(), signal.into());
            }
            body.insert(
                "duration_ms".to_string(),
                (outcome.duration.as_millis() as u64).into(),
            );
            match outcome.failure() {
                None => AlertPayload::success(source, AlertKind::Decorator, Some(body)),
                Some(reason) => {
                    AlertPayload::failure(source, AlertKind::Decorator, Some(body), reason)
                }
            }
        }
        Err(e) => AlertPayload::failure(source, AlertKind::Decorator, Some(body), e.to_string()),
    }
}

/// Run `command`, report the result, and return the exit code the agent
/// should exit with.
pub async fn exec(
    command: &[String],
    dispatcher: &Dispatcher,
    context: CallContext,
    mut shutdown: Shutdown,
) -> i32 {
    let result = run_command(command, &mut shutdown).await;
    let code = match &result {
        Ok(outcome) => {
            if !outcome.succeeded() {
                tracing::warn!(code = outcome.shell_code(), "command failed");
            }
            outcome.shell_code()
        }
        Err(e) => {
            tracing::error!(error = %e, "command did not run");
            e.shell_code()
        }
    };

    let payload = report(command, &result, context.with_cmdline(command.join(" ")));
    if let Err(e) = dispatcher.dispatch(&payload).await {
        tracing::warn!(error = %e, "failed to report command result");
    }
    code
}
