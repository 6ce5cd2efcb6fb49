/// Process queries used by the liveness and stalled-process watchers.
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::Command;

/// OS capability for inspecting processes.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// Whether a live (non-zombie) process with this PID exists.
    async fn exists(&self, pid: u32) -> std::io::Result<bool>;

    /// Whether any process with this executable name is running.
    async fn find_by_name(&self, name: &str) -> std::io::Result<bool>;

    /// The `ps` STAT field for the process, or `None` once it can no longer be queried.
    async fn scheduler_state(&self, pid: u32) -> std::io::Result<Option<String>>;
}

/// Sleeping (`S`) in the foreground process group (`+`): the signature of a
/// process blocked on an interactive prompt such as a debugger breakpoint.
pub fn is_parked(state: &str) -> bool {
    state.starts_with('S') && state.contains('+')
}

/// Exited but not yet reaped by its parent.
pub fn is_zombie(state: &str) -> bool {
    state.starts_with('Z')
}

/// `ps` truncates command names (15 bytes on Linux).
const COMM_LEN: usize = 15;

fn name_matches(comm: &str, name: &str) -> bool {
    let comm = comm.trim();
    if comm.is_empty() {
        return false;
    }
    let base = comm.rsplit('/').next().unwrap_or(comm);
    if base == name {
        return true;
    }
    name.len() > COMM_LEN && name.is_char_boundary(COMM_LEN) && base == &name[..COMM_LEN]
}

/// Probe backed by `kill(pid, 0)` and the system `ps`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl SystemProbe {
    async fn ps(args: &[&str]) -> std::io::Result<Option<String>> {
        let output = Command::new("ps").args(args).output().await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

#[async_trait]
impl ProcessProbe for SystemProbe {
    async fn exists(&self, pid: u32) -> std::io::Result<bool> {
        let Ok(raw) = i32::try_from(pid) else {
            return Ok(false);
        };
        match kill(Pid::from_raw(raw), None) {
            // EPERM: the process exists but belongs to someone else
            Ok(()) | Err(Errno::EPERM) => {}
            Err(Errno::ESRCH) => return Ok(false),
            Err(e) => return Err(std::io::Error::from(e)),
        }
        match self.scheduler_state(pid).await? {
            Some(state) => Ok(!is_zombie(&state)),
            None => Ok(false),
        }
    }

    async fn find_by_name(&self, name: &str) -> std::io::Result<bool> {
        let Some(listing) = Self::ps(&["-A", "-o", "stat=,comm="]).await? else {
            return Ok(false);
        };
        Ok(listing.lines().any(|line| {
            let line = line.trim();
            let (stat, comm) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            !is_zombie(stat) && name_matches(comm, name)
        }))
    }

    async fn scheduler_state(&self, pid: u32) -> std::io::Result<Option<String>> {
        let pid = pid.to_string();
        let state = Self::ps(&["-o", "stat=", "-p", &pid]).await?;
        Ok(state
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }
}
