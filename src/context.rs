/// Host, user and command-line metadata attached to every alert.
use serde::Serialize;
use std::net::UdpSocket;

/// Snapshot of where an alert came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallContext {
    pub hostname: String,
    pub ip: String,
    pub user: String,
    pub cmdline: String,
}

const UNKNOWN: &str = "unknown";

impl CallContext {
    /// Resolve the context of the current process. Never fails; unresolvable
    /// fields are reported as "unknown".
    pub fn resolve() -> Self {
        Self {
            hostname: hostname(),
            ip: local_ip().unwrap_or_else(|| UNKNOWN.to_string()),
            user: user(),
            cmdline: std::env::args().collect::<Vec<_>>().join(" "),
        }
    }

    /// Same context, reporting a different command line (e.g. a wrapped child).
    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// The address the OS would use as source for outbound traffic.
///
/// Connecting a UDP socket sends no packets; it only selects a route.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

fn user() -> String {
    let uid = nix::unistd::getuid();
    if let Ok(Some(u)) = nix::unistd::User::from_uid(uid) {
        return u.name;
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| UNKNOWN.to_string())
}
