//! fanout worker agent binary.
//!
//! `fanout-wkr worker` speaks the protocol on stdin/stdout with the
//! coordinator and spawns one `fanout-wkr runner` child per slot. Neither
//! mode logs to stdout: it is the message channel.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fanout_common::config::DEFAULT_CONFIG_FILE;
use fanout_common::{LogConfig, Role, RunConfig, Transport, init_logging};
use fanout_wkr::{
    CommandExecutor, ProcessRunnerLauncher, Runner, RunnerListenerRegistry, SlotServices, Worker,
};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Environment variable naming the run environment for jobs.
const ENV_VAR: &str = "FANOUT_ENV";

/// Environment variable carrying the slot index into jobs.
const SLOT_VAR: &str = "FANOUT_SLOT";

#[derive(Parser)]
#[command(name = "fanout-wkr")]
#[command(author, version, about = "fanout worker agent - runs jobs on this machine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run configuration file
    #[arg(short, long, global = true, env = "FANOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Label of the remote host this agent runs on
    #[arg(long, global = true)]
    remote: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise runner slots, talking to the coordinator on stdin/stdout
    Worker {
        /// Number of runner slots
        #[arg(long, default_value = "1")]
        slots: usize,
    },

    /// Execute jobs for one slot, talking to the worker on stdin/stdout
    Runner {
        /// Slot index
        #[arg(long)]
        slot: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("fanout-wkr: {err:#}");
            1
        }
    };
    // Exit explicitly: a blocked stdin read would otherwise hold the runtime open.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = RunConfig::load_optional(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let verbose = cli.verbose || config.verbose;

    match cli.command {
        Commands::Worker { slots } => {
            // Local workers share the coordinator's stderr.
            let log_config = LogConfig::from_env("warn")
                .verbose(verbose)
                .with_stderr()
                .with_remote(cli.remote.is_some());
            let _logging_guards = init_logging(&log_config)?;

            let launcher = ProcessRunnerLauncher::current_exe(runner_args(&cli, verbose))?;
            let label = cli.remote.clone().unwrap_or_else(|| "local".to_string());
            info!(slots, worker = %label, "Worker starting");

            Worker::new(Transport::stdio(Role::Worker, "master"), launcher, slots.max(1))
                .with_keepalive(config.keepalive_interval()?)
                .run()
                .await?;
            Ok(())
        }
        Commands::Runner { slot } => {
            let log_config = LogConfig::from_env("info")
                .verbose(verbose)
                .with_file(config.runner_log_path(slot));
            let _logging_guards = init_logging(&log_config)?;

            run_runner(&config, slot).await
        }
    }
}

async fn run_runner(config: &RunConfig, slot: usize) -> Result<()> {
    let listeners = RunnerListenerRegistry::default().build(&config.runner_listeners)?;
    let services = SlotServices::start(&config.services, slot, Path::new("log"))
        .await
        .context("starting slot services")?;

    let environment = std::env::var(ENV_VAR).unwrap_or_else(|_| config.environment.clone());
    let executor = CommandExecutor::from_config(&config.executor)?
        .with_envs(services.env())
        .with_env(SLOT_VAR, slot)
        .with_env(ENV_VAR, environment);

    let exit = Runner::new(slot, Transport::stdio(Role::Runner, "worker"), executor)
        .with_services(services)
        .with_listeners(listeners)
        .with_keepalive(config.keepalive_interval()?)
        .run()
        .await;
    info!(slot, ?exit, "Runner exiting");
    Ok(())
}

/// Flags every runner child inherits from its worker.
fn runner_args(cli: &Cli, verbose: bool) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(config) = &cli.config {
        args.push("--config".to_string());
        args.push(config.display().to_string());
    }
    if let Some(remote) = &cli.remote {
        args.push("--remote".to_string());
        args.push(remote.clone());
    }
    if verbose {
        args.push("--verbose".to_string());
    }
    args
}
