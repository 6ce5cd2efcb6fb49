mod alert;
mod beat;
mod config;
mod context;
mod dispatch;
mod exec;
mod probe;
mod redact;
mod signals;
mod supervisor;
mod tail;
mod watch;

use clap::{Args, Parser, Subcommand};
use config::{ConfigError, WardenConfig, WatchSpec};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// A Rust CLI agent that watches log files, directories and processes and
/// posts JSON alerts to an HTTP endpoint.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Config file path
    #[arg(short, long, global = true, env = "WARDEN_CONFIG", default_value = "warden.toml")]
    config: PathBuf,

    /// Alert endpoint URL (overrides api.endpoint)
    #[arg(long, global = true, env = "WARDEN_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer token sent with every alert (overrides api.key)
    #[arg(long, global = true, env = "WARDEN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Debug logging (every tick and probe)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

// Keeps the API key out of debug output.
impl std::fmt::Debug for GlobalArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalArgs")
            .field("config", &self.config)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("verbose", &self.verbose)
            .field("quiet", &self.quiet)
            .finish()
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every watch in the config file
    Watch,

    /// Alert on lines containing a pattern in a file or directory
    Logs {
        /// Log file or directory of log files
        #[arg(long)]
        path: PathBuf,

        /// Substring to look for (repeatable)
        #[arg(long = "pattern", required = true)]
        patterns: Vec<String>,

        /// Fallback poll interval in seconds
        #[arg(long, default_value_t = 2)]
        poll_interval: u64,
    },

    /// Alert when a file or directory stops changing
    Idle {
        #[arg(long)]
        path: PathBuf,

        /// Seconds without change before alerting
        #[arg(long, default_value_t = 60)]
        interval: u64,

        /// Alerts to send before going quiet until the next change
        #[arg(long, default_value_t = 3)]
        checks: u32,
    },

    /// Alert once when a process exits
    Process {
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        pid: Option<u32>,

        /// Executable name
        #[arg(long)]
        name: Option<String>,
    },

    /// Alert when a process sits at an interactive prompt
    Stalled {
        #[arg(long)]
        pid: u32,

        /// Seconds between state checks
        #[arg(long)]
        check_interval: Option<u64>,

        /// Consecutive parked checks before alerting
        #[arg(long)]
        checks: Option<u32>,

        /// Extra seconds to wait after a parked check
        #[arg(long)]
        throttle: Option<u64>,

        /// Seconds to pause after an alert
        #[arg(long)]
        long_pause: Option<u64>,
    },

    /// Run a command and report how it ended
    Exec {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Append a heartbeat line to a file on an interval
    Beat {
        #[arg(long)]
        file: PathBuf,

        /// Seconds between heartbeats
        #[arg(long, default_value_t = beat::DEFAULT_INTERVAL.as_secs())]
        interval: u64,

        /// Lines kept before the file is emptied
        #[arg(long, default_value_t = beat::DEFAULT_MAX_LINES)]
        max_lines: usize,
    },

    /// Validate configuration and print the resolved watch list
    Check,
}

impl Command {
    /// The single watch an ad hoc subcommand stands for.
    fn ad_hoc_watch(&self) -> Option<WatchSpec> {
        match self {
            Command::Logs {
                path,
                patterns,
                poll_interval,
            } => Some(WatchSpec::Pattern {
                path: path.clone(),
                patterns: patterns.clone(),
                poll_interval_secs: *poll_interval,
            }),
            Command::Idle {
                path,
                interval,
                checks,
            } => Some(WatchSpec::Inactivity {
                path: path.clone(),
                interval_secs: *interval,
                num_checks: *checks,
            }),
            Command::Process { pid, name } => Some(WatchSpec::Liveness {
                pid: *pid,
                name: name.clone(),
            }),
            Command::Stalled {
                pid,
                check_interval,
                checks,
                throttle,
                long_pause,
            } => Some(WatchSpec::Stalled {
                pid: *pid,
                check_interval_secs: *check_interval,
                num_checks: *checks,
                throttle_secs: *throttle,
                long_pause_secs: *long_pause,
            }),
            Command::Watch | Command::Exec { .. } | Command::Beat { .. } | Command::Check => None,
        }
    }
}

fn init_tracing(global: &GlobalArgs) {
    let level = if global.verbose {
        "debug"
    } else if global.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warden={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<WardenConfig, ConfigError> {
    let mut config = config::load(&cli.global.config)?;
    if let Some(endpoint) = &cli.global.endpoint {
        config.api.endpoint = endpoint.clone();
    }
    if let Some(key) = &cli.global.api_key {
        config.api.key = Some(key.clone());
    }
    if let Some(spec) = cli.command.ad_hoc_watch() {
        config.logfile = None;
        config.watches = vec![spec];
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    if let Command::Beat {
        file,
        interval,
        max_lines,
    } = &cli.command
    {
        let shutdown = signals::install()?;
        let mut writer = beat::HeartbeatWriter::new(file, *max_lines);
        writer
            .run(std::time::Duration::from_secs((*interval).max(1)), shutdown)
            .await?;
        return Ok(0);
    }

    let config = load_config(&cli)?;
    config.validate_api()?;
    let dispatcher = dispatch::Dispatcher::new(&config.api)?;
    let call_context = context::CallContext::resolve();

    if let Command::Exec { command } = &cli.command {
        let shutdown = signals::install()?;
        return Ok(exec::exec(command, &dispatcher, call_context, shutdown).await);
    }

    let plans = config.watch_plans()?;

    if let Command::Check = cli.command {
        println!("config: {}", cli.global.config.display());
        println!("endpoint: {}", dispatcher.endpoint());
        println!("watches:");
        for plan in &plans {
            println!("  {}", plan.describe());
        }
        return Ok(0);
    }

    let probe: Arc<dyn probe::ProcessProbe> = Arc::new(probe::SystemProbe);
    let mut supervisor = supervisor::Supervisor::new(dispatcher, call_context)
        .with_queue_size(config.api.queue_size);
    for plan in plans {
        tracing::info!(watch = %plan.describe(), "watch configured");
        supervisor.add(watch::build(plan, Arc::clone(&probe)));
    }

    tracing::info!(watchers = supervisor.len(), "starting watchers");

    let shutdown = signals::install()?;
    supervisor.run(shutdown).await;
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.global);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("warden: {e}");
            if e.is::<ConfigError>() {
                2
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}
