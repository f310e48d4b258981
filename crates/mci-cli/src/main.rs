//! mci - distributed CI control plane and worker agent.
//!
//! One binary exposes the background service loops, the agent-facing API
//! server, the worker agent itself, and the admin/host/project tools.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mci_core::settings::{Settings, DEFAULT_SETTINGS_FILE};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// mci - CI task dispatch and host lifecycle control plane
#[derive(Parser, Debug)]
#[command(name = "mci")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run MCI services
    #[command(subcommand)]
    Service(ServiceCommands),

    /// Run the worker agent (started by the dispatcher, not manually)
    Agent {
        /// Id of the task to run
        #[arg(long = "task_id")]
        task_id: String,

        /// Secret of the task to run
        #[arg(long = "task_secret")]
        task_secret: String,

        /// Id of the machine the agent runs on
        #[arg(long = "host_id")]
        host_id: String,

        /// Secret for the current host
        #[arg(long = "host_secret")]
        host_secret: String,

        /// URL of the API server
        #[arg(long = "api_server")]
        api_server: String,

        /// Path to a self-signed PEM certificate
        #[arg(long = "https_cert")]
        https_cert: Option<PathBuf>,

        /// Directory tasks execute in
        #[arg(long = "working_dir", default_value = "/data/mci")]
        working_dir: PathBuf,

        /// Prefix for the agent's log file; stdout when unset
        #[arg(long = "log_prefix")]
        log_prefix: Option<String>,

        /// Path to the pid file
        #[arg(long = "pid_file")]
        pid_file: Option<PathBuf>,
    },

    /// Administrative switches
    #[command(subcommand)]
    Admin(AdminCommands),

    /// Host operations
    #[command(subcommand)]
    Host(HostCommands),

    /// Check that a project file parses and validates
    Validate {
        /// Path to the project YAML
        path: PathBuf,
    },

    /// Expand a project file and print the result
    Evaluate {
        /// Path to the project YAML
        path: PathBuf,

        /// Extra expansions as name=value pairs
        #[arg(long = "var")]
        vars: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ServiceCommands {
    /// Start the background loops (scheduler, dispatcher, monitor, hostinit)
    Runner,

    /// Start the agent-facing API server
    Web,

    /// Start the loops and the API server in one process
    All,
}

#[derive(Subcommand, Debug)]
enum AdminCommands {
    /// Set (or clear) the site banner
    Banner {
        /// Banner text; empty clears it
        #[arg(default_value = "")]
        message: String,
    },

    /// Disable a named service loop
    DisableService {
        /// One of: scheduler, taskrunner, monitor, hostinit
        name: String,
    },

    /// Re-enable a named service loop
    EnableService {
        /// One of: scheduler, taskrunner, monitor, hostinit
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum HostCommands {
    /// Create a host record for a distro
    Create {
        /// Distro to build the host from
        #[arg(long)]
        distro: String,
    },

    /// List all hosts
    List,

    /// Terminate a host
    Terminate {
        /// Host id
        host_id: String,
    },

    /// Show one host's status
    Status {
        /// Host id
        host_id: String,
    },
}

fn init_tracing(level: &str, log_file: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "mci={level},mci_core={level},mci_server={level},mci_agent={level}"
        ))
    });
    let registry = tracing_subscriber::registry().with(filter);
    match log_file.and_then(|path| std::fs::File::create(path).ok()) {
        Some(file) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Arc::new(file)),
            )
            .init(),
        None => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load_settings(path: &PathBuf) -> Result<Settings> {
    if path.exists() {
        Ok(Settings::from_file(path)?)
    } else {
        tracing::warn!(path = %path.display(), "settings file not found; using defaults");
        Ok(Settings::default())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_file = match &cli.command {
        Commands::Agent {
            log_prefix: Some(prefix),
            ..
        } => Some(format!("{prefix}_pid_{}.log", std::process::id())),
        _ => None,
    };
    init_tracing(&cli.log_level, log_file.as_deref());

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        },
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Service(service) => {
            let settings = load_settings(&cli.config)?;
            match service {
                ServiceCommands::Runner => commands::service::runner(settings).await?,
                ServiceCommands::Web => commands::service::web(settings).await?,
                ServiceCommands::All => commands::service::all(settings).await?,
            }
            Ok(0)
        },
        Commands::Agent {
            task_id,
            task_secret,
            host_id,
            host_secret,
            api_server,
            https_cert,
            working_dir,
            log_prefix: _,
            pid_file,
        } => {
            let options = mci_agent::AgentOptions {
                api_server,
                task_id,
                task_secret,
                host_id,
                host_secret,
                https_cert,
                working_dir,
                pid_file,
            };
            Ok(mci_agent::run(options).await)
        },
        Commands::Admin(admin) => {
            let settings = load_settings(&cli.config)?;
            commands::admin::run(settings, admin).await?;
            Ok(0)
        },
        Commands::Host(host) => {
            let settings = load_settings(&cli.config)?;
            commands::host::run(settings, host).await?;
            Ok(0)
        },
        Commands::Validate { path } => {
            commands::project::validate(&path)?;
            Ok(0)
        },
        Commands::Evaluate { path, vars } => {
            let settings = load_settings(&cli.config)?;
            commands::project::evaluate(&settings, &path, &vars)?;
            Ok(0)
        },
    }
}
