use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use etude_core::config::HostConfig;
use etude_core::logging::{init_logging, init_logging_json};
use etude_core::{EtudeError, Inbound, Payload, Protocol, Server, ServerConfig, supervisor};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Prefork socket server: static HTTP files or a WebSocket echo")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor and its workers
    Start {
        #[command(flatten)]
        target: Target,
        /// Number of worker processes
        #[arg(long, short)]
        workers: Option<usize>,
        /// Detach from the terminal
        #[arg(long, short)]
        daemon: bool,
        /// Do not re-fork workers that exit
        #[arg(long)]
        no_respawn: bool,
        /// Document root for the default host
        #[arg(long)]
        root: Option<PathBuf>,
        /// Where a daemon writes stdout and stderr
        #[arg(long)]
        stdout: Option<PathBuf>,
    },
    /// Stop a running server
    Stop {
        #[command(flatten)]
        target: Target,
        /// Seconds to wait for the supervisor to exit
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Restart the workers of a running server
    Restart {
        #[command(flatten)]
        target: Target,
    },
    /// Print the status of a running server
    Status {
        #[command(flatten)]
        target: Target,
        /// Print JSON instead of the plain report
        #[arg(long)]
        json: bool,
    },
}

/// Which server a command talks to.
#[derive(Args)]
struct Target {
    /// Listen address, e.g. http://0.0.0.0:8080 or ws://0.0.0.0:9000
    listen: Option<String>,
    /// JSON configuration file (default: ETUDE_* environment variables)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Key of the shared counter store
    #[arg(long)]
    shm_key: Option<String>,
}

impl Target {
    fn load(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::from_env().context("reading ETUDE_* variables")?,
        };
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(key) = &self.shm_key {
            config.shm_key = Some(key.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.log_json {
        init_logging_json();
    } else {
        init_logging();
    }

    match cli.command {
        Commands::Start {
            target,
            workers,
            daemon,
            no_respawn,
            root,
            stdout,
        } => {
            let mut config = target.load()?;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            config.daemon |= daemon;
            if no_respawn {
                config.respawn = false;
            }
            if let Some(root) = root {
                config.hosts.insert("default".to_string(), HostConfig::new(root));
            }
            if stdout.is_some() {
                config.stdout_path = stdout;
            }
            start(config)
        }
        Commands::Stop { target, timeout } => {
            let key = target.load()?.shm_key();
            let pid = running(supervisor::stop(&key))?;
            if !supervisor::wait_for_exit(pid, Duration::from_secs(timeout)) {
                bail!("server (pid {pid}) still running after {timeout}s");
            }
            println!("stopped pid {pid}");
            Ok(())
        }
        Commands::Restart { target } => {
            let key = target.load()?.shm_key();
            let pid = running(supervisor::restart(&key))?;
            println!("restart signalled to pid {pid}");
            Ok(())
        }
        Commands::Status { target, json } => {
            let key = target.load()?.shm_key();
            let snapshot = running(supervisor::status(&key))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{snapshot}");
            }
            Ok(())
        }
    }
}

fn running<T>(result: Result<T, EtudeError>) -> Result<T> {
    match result {
        Err(EtudeError::NotRunning) => bail!("server is not running"),
        other => Ok(other?),
    }
}

fn start(config: ServerConfig) -> Result<()> {
    let protocol = config.listen_addr()?.protocol;
    if protocol == Protocol::Http && config.hosts.is_empty() {
        warn!("no document root configured, every GET will be answered with 404");
    }
    info!(listen = %config.listen, workers = config.workers, "starting");

    let server = Server::from_config(config)?;
    let server = match protocol {
        Protocol::WebSocket => server.on_message(|h, inbound| {
            if let Inbound::Message(bytes) = inbound {
                h.send_string(Payload::Message(bytes));
            }
        }),
        Protocol::Http => server,
    };
    server.run()?;
    Ok(())
}
