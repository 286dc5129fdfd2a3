//! kilnd - self-hosted CI server daemon.
//!
//! Normal invocation loads the configuration, bootstraps both stores, syncs
//! the configured repositories and runs the dispatch loop until SIGINT or
//! SIGTERM. The hidden `builder` subcommand is how the daemon re-executes
//! itself to run one build in a detached child process; builders keep
//! running across daemon restarts and are re-discovered from the build
//! store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_core::build::builder::run_builder;
use kiln_core::build::controller::BuilderController;
use kiln_core::build::processor::Processor;
use kiln_core::github::GitHubStatusClient;
use kiln_core::store::db::{DbStore, Repo};
use kiln_core::store::fs::FsStore;
use kiln_core::Config;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DB_FILE: &str = "kiln.db";

#[derive(Parser, Debug)]
#[command(name = "kilnd", version, about = "Self-hosted CI server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "kiln.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one build in a child process (spawned by the server)
    #[command(hide = true)]
    Builder,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let outcome = match args.command {
        Some(Command::Builder) => run_builder().map_err(anyhow::Error::from),
        None => serve(&args),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("fatal: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn serve(args: &Args) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from '{}'", args.config.display()))?;

    let fs = FsStore::new(&config.data_dir);
    fs.create_root_dirs()
        .context("failed to create data directories")?;

    let db = DbStore::open(&config.data_dir.join(DB_FILE)).context("failed to open build store")?;
    for repo in &config.repos {
        db.create_repo_if_not_exists(&Repo {
            owner: repo.owner.clone(),
            name: repo.name.clone(),
        })
        .with_context(|| format!("failed to register repository {}/{}", repo.owner, repo.name))?;
    }
    info!(repos = config.repos.len(), "repositories synced");

    let status = match &config.github {
        Some(github) => Some(
            GitHubStatusClient::new(github.token.clone())
                .context("failed to build GitHub status client")?,
        ),
        None => None,
    };

    let processor = Processor {
        db,
        fs: fs.clone(),
        controller: BuilderController::new(fs),
        status,
        config,
    };

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let dispatcher = thread::Builder::new()
        .name("kiln-dispatcher".to_string())
        .spawn(move || processor.run(&shutdown_rx))
        .context("failed to spawn dispatcher thread")?;
    info!("dispatcher running");

    wait_for_shutdown_signal()?;
    info!("shutting down; live builders stay detached");

    let _ = shutdown_tx.send(());
    dispatcher
        .join()
        .map_err(|_| anyhow::anyhow!("dispatcher thread panicked"))?;
    Ok(())
}

fn wait_for_shutdown_signal() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build signal runtime")?;
    runtime.block_on(async {
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
        Ok::<(), std::io::Error>(())
    })?;
    Ok(())
}
