use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Poll cadence of the liveness watcher.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WardenConfig {
    /// Legacy single-file pattern watch, kept for old config files.
    pub logfile: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub api: ApiConfig,
    pub stalled: StalledConfig,
    #[serde(rename = "watch")]
    pub watches: Vec<WatchSpec>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
    pub key: Option<String>,
    pub timeout_secs: u64,
    /// Alerts waiting for delivery beyond this are dropped.
    pub queue_size: usize,
    pub redact: bool,
    pub headers: BTreeMap<String, String>,
}

/// Defaults applied to stalled-process watches that leave fields unset.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct StalledConfig {
    pub check_interval_secs: u64,
    pub num_checks: u32,
    pub throttle_secs: u64,
    pub long_pause_secs: u64,
}

/// One `[[watch]]` entry as written in the config file.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchSpec {
    Pattern {
        path: PathBuf,
        patterns: Vec<String>,
        #[serde(default = "default_poll_interval")]
        poll_interval_secs: u64,
    },
    Inactivity {
        path: PathBuf,
        #[serde(default = "default_inactivity_interval")]
        interval_secs: u64,
        #[serde(default = "default_num_checks")]
        num_checks: u32,
    },
    Liveness {
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        name: Option<String>,
    },
    Stalled {
        pid: u32,
        #[serde(default)]
        check_interval_secs: Option<u64>,
        #[serde(default)]
        num_checks: Option<u32>,
        #[serde(default)]
        throttle_secs: Option<u64>,
        #[serde(default)]
        long_pause_secs: Option<u64>,
    },
}

/// A process identified either by PID or by executable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessRef {
    Pid(u32),
    Name(String),
}

impl std::fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRef::Pid(pid) => write!(f, "pid {pid}"),
            ProcessRef::Name(name) => write!(f, "process '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternSettings {
    pub path: PathBuf,
    pub patterns: Vec<String>,
    pub poll_interval: Duration,
    pub redact: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InactivitySettings {
    pub path: PathBuf,
    pub interval: Duration,
    pub num_checks: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessSettings {
    pub process: ProcessRef,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StalledSettings {
    pub pid: u32,
    pub check_interval: Duration,
    pub num_checks: u32,
    pub throttle: Duration,
    pub long_pause: Duration,
}

/// A validated watch, with every default resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchPlan {
    Pattern(PatternSettings),
    Inactivity(InactivitySettings),
    Liveness(LivenessSettings),
    Stalled(StalledSettings),
}

impl WatchPlan {
    /// Short human-readable label used in logs and `warden check`.
    pub fn describe(&self) -> String {
        match self {
            WatchPlan::Pattern(s) => format!(
                "pattern {} [{}]",
                s.path.display(),
                s.patterns.join(", ")
            ),
            WatchPlan::Inactivity(s) => format!(
                "inactivity {} every {}s (max {} alerts)",
                s.path.display(),
                s.interval.as_secs(),
                s.num_checks
            ),
            WatchPlan::Liveness(s) => format!("liveness {}", s.process),
            WatchPlan::Stalled(s) => format!(
                "stalled pid {} every {}s ({} checks, pause {}s)",
                s.pid,
                s.check_interval.as_secs(),
                s.num_checks,
                s.long_pause.as_secs()
            ),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Missing {
        field: &'static str,
    },
    Invalid {
        field: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Missing { field } => {
                write!(f, "missing required config field `{field}`")
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config field `{field}`: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Missing { .. } | ConfigError::Invalid { .. } => None,
        }
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Load the config file at `path`.
///
/// A missing file yields the defaults so ad hoc commands can run with only
/// `--endpoint`; anything else that goes wrong is an error.
pub fn load(path: &Path) -> Result<WardenConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(WardenConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    parse(&contents, path)
}

fn parse(contents: &str, path: &Path) -> Result<WardenConfig, ConfigError> {
    toml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl WardenConfig {
    /// Check the API section. Called before any watcher starts.
    pub fn validate_api(&self) -> Result<(), ConfigError> {
        let endpoint = self.api.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ConfigError::Missing {
                field: "api.endpoint",
            });
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(invalid(
                "api.endpoint",
                format!("`{endpoint}` is not an http(s) URL"),
            ));
        }
        if self.api.timeout_secs == 0 {
            return Err(invalid("api.timeout_secs", "must be greater than zero"));
        }
        if self.api.queue_size == 0 {
            return Err(invalid("api.queue_size", "must be greater than zero"));
        }
        Ok(())
    }

    /// All configured watches, including the legacy `logfile`/`patterns` pair.
    pub fn all_specs(&self) -> Vec<WatchSpec> {
        let mut specs = Vec::with_capacity(self.watches.len() + 1);
        if let Some(logfile) = &self.logfile {
            specs.push(WatchSpec::Pattern {
                path: logfile.clone(),
                patterns: self.patterns.clone(),
                poll_interval_secs: default_poll_interval(),
            });
        }
        specs.extend(self.watches.iter().cloned());
        specs
    }

    /// Validate every watch and resolve defaults.
    pub fn watch_plans(&self) -> Result<Vec<WatchPlan>, ConfigError> {
        let specs = self.all_specs();
        if specs.is_empty() {
            return Err(ConfigError::Missing { field: "watch" });
        }
        specs
            .iter()
            .enumerate()
            .map(|(i, spec)| self.resolve(i, spec))
            .collect()
    }

    fn resolve(&self, index: usize, spec: &WatchSpec) -> Result<WatchPlan, ConfigError> {
        let field = |name: &str| format!("watch[{index}].{name}");
        match spec {
            WatchSpec::Pattern {
                path,
                patterns,
                poll_interval_secs,
            } => {
                if patterns.is_empty() || patterns.iter().any(|p| p.is_empty()) {
                    return Err(invalid(
                        field("patterns"),
                        "at least one non-empty pattern is required",
                    ));
                }
                if !(path.is_file() || path.is_dir()) {
                    return Err(invalid(
                        field("path"),
                        format!("{} is neither a file nor a directory", path.display()),
                    ));
                }
                Ok(WatchPlan::Pattern(PatternSettings {
                    path: path.clone(),
                    patterns: patterns.clone(),
                    poll_interval: Duration::from_secs(positive(
                        *poll_interval_secs,
                        &field("poll_interval_secs"),
                    )?),
                    redact: self.api.redact,
                }))
            }
            WatchSpec::Inactivity {
                path,
                interval_secs,
                num_checks,
            } => {
                if !path.exists() {
                    return Err(invalid(
                        field("path"),
                        format!("{} does not exist", path.display()),
                    ));
                }
                Ok(WatchPlan::Inactivity(InactivitySettings {
                    path: path.clone(),
                    interval: Duration::from_secs(positive(
                        *interval_secs,
                        &field("interval_secs"),
                    )?),
                    num_checks: positive(*num_checks, &field("num_checks"))?,
                }))
            }
            WatchSpec::Liveness { pid, name } => {
                let process = match (pid, name) {
                    (Some(pid), None) => ProcessRef::Pid(*pid),
                    (None, Some(name)) if !name.is_empty() => ProcessRef::Name(name.clone()),
                    _ => {
                        return Err(invalid(
                            field("pid"),
                            "exactly one of `pid` or `name` is required",
                        ))
                    }
                };
                Ok(WatchPlan::Liveness(LivenessSettings {
                    process,
                    poll_interval: LIVENESS_POLL_INTERVAL,
                }))
            }
            WatchSpec::Stalled {
                pid,
                check_interval_secs,
                num_checks,
                throttle_secs,
                long_pause_secs,
            } => {
                let d = &self.stalled;
                Ok(WatchPlan::Stalled(StalledSettings {
                    pid: *pid,
                    check_interval: Duration::from_secs(positive(
                        check_interval_secs.unwrap_or(d.check_interval_secs),
                        &field("check_interval_secs"),
                    )?),
                    num_checks: positive(
                        num_checks.unwrap_or(d.num_checks),
                        &field("num_checks"),
                    )?,
                    throttle: Duration::from_secs(throttle_secs.unwrap_or(d.throttle_secs)),
                    long_pause: Duration::from_secs(long_pause_secs.unwrap_or(d.long_pause_secs)),
                }))
            }
        }
    }
}

fn positive<T: PartialEq + Default + Copy>(value: T, field: &str) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(value)
}

fn default_poll_interval() -> u64 {
    2
}
fn default_inactivity_interval() -> u64 {
    60
}
fn default_num_checks() -> u32 {
    3
}

// --- Default implementations ---

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            key: None,
            timeout_secs: 10,
            queue_size: crate::supervisor::DEFAULT_QUEUE_SIZE,
            redact: true,
            headers: BTreeMap::new(),
        }
    }
}

impl Default for StalledConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            num_checks: 3,
            throttle_secs: 1,
            long_pause_secs: 300,
        }
    }
}
