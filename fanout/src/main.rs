//! fanout coordinator binary.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use fanout_common::config::DEFAULT_CONFIG_FILE;
use fanout_common::{LogConfig, OutputLock, RunConfig, init_logging};
use fanout::listener::REPORT_GENERATOR;
use fanout::{
    HistoryReport, ListenerContext, ListenerRegistry, Master, MasterError, ProcessLauncher,
    RetryPolicy, install_interrupt_handler, remote_syncs, sync_all,
};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Listener used when neither the config nor the command line names one.
const DEFAULT_LISTENER: &str = "minimal_output";

#[derive(Parser)]
#[command(name = "fanout")]
#[command(author, version, about = "Distribute jobs across local and remote workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run configuration file
    #[arg(short, long, global = true, env = "FANOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run jobs across the configured workers
    Run {
        /// Keep the given job order instead of sorting by past duration
        #[arg(long)]
        no_autosort: bool,

        /// Listener to attach (repeatable)
        #[arg(long = "listener", value_name = "NAME")]
        listeners: Vec<String>,

        /// Job files, appended to `files` from the config
        files: Vec<String>,
    },

    /// Stage the working tree onto every remote worker
    Sync,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            match err.downcast_ref::<MasterError>() {
                Some(master) => {
                    if matches!(master, MasterError::ConnectionLost { .. }) {
                        eprintln!("{} {}", "Error:".red().bold(), master);
                    } else {
                        eprintln!("fanout: {err:#}");
                    }
                    master.exit_code()
                }
                None => {
                    eprintln!("fanout: {err:#}");
                    1
                }
            }
        }
    };
    // Exit explicitly: worker stdio tasks would otherwise hold the runtime open.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let explicit_config = cli.config.is_some();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = if explicit_config {
        RunConfig::load(&config_path)
    } else {
        RunConfig::load_optional(&config_path)
    }
    .with_context(|| format!("loading {}", config_path.display()))?;
    let verbose = cli.verbose || config.verbose;

    let log_config = LogConfig::from_env("warn").verbose(verbose).with_stderr();
    let _logging_guards = init_logging(&log_config)?;

    let worker_config = config_path.exists().then(|| config_path.clone());
    match cli.command {
        Commands::Run {
            no_autosort,
            listeners,
            files,
        } => {
            run_jobs(config, worker_config, verbose, no_autosort, listeners, files).await
        }
        Commands::Sync => sync(&config).await,
    }
}

async fn run_jobs(
    mut config: RunConfig,
    config_path: Option<PathBuf>,
    verbose: bool,
    no_autosort: bool,
    extra_listeners: Vec<String>,
    files: Vec<String>,
) -> Result<i32> {
    config.verbose = verbose;
    if no_autosort {
        config.autosort = false;
    }
    config.files.extend(files);

    let mut names = config.listeners.clone();
    names.extend(extra_listeners);
    if names.is_empty() {
        names.push(DEFAULT_LISTENER.to_string());
    }
    if config.autosort && !names.iter().any(|n| n == REPORT_GENERATOR) {
        names.push(REPORT_GENERATOR.to_string());
    }

    let registry = ListenerRegistry::default();
    registry.validate(&names)?;
    let history_path = config.history_path();
    let context = ListenerContext {
        output: OutputLock::stdout(),
        history_path: history_path.clone(),
    };
    let listeners = registry.build(&names, &context)?;

    let history = config.autosort.then(|| HistoryReport::load(&history_path));
    if let Some(history) = &history {
        info!(path = %history_path.display(), known = history.len(), "Loaded job history");
    }

    let retry = RetryPolicy::from_config(&config.retry).map_err(MasterError::from)?;
    let interrupt = install_interrupt_handler(&config.signals)?;
    let launcher = ProcessLauncher::from_config(&config, config_path);

    let summary = Master::new(config.files.clone(), config.workers.clone(), launcher)
        .with_listeners(listeners)
        .with_retry(retry)
        .with_history(history)
        .with_interrupt(interrupt)
        .run()
        .await?;

    if summary.interrupted {
        warn!("Run interrupted");
    }
    Ok(summary.exit_code())
}

async fn sync(config: &RunConfig) -> Result<i32> {
    let syncs = remote_syncs(config);
    if syncs.is_empty() {
        println!("Nothing to sync: no [sync] section or no remote workers");
        return Ok(0);
    }

    let mut failed = 0;
    for (target, result) in sync_all(&syncs).await {
        match result {
            Ok(()) => println!("{} {}", "synced".green(), target),
            Err(err) => {
                failed += 1;
                println!("{} {}: {}", "failed".red(), target, err);
            }
        }
    }
    Ok(if failed == 0 { 0 } else { 1 })
}
