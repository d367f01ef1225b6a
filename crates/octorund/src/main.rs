//! octorund — the octorun daemon.
//!
//! Runs the RunnerSet controller against the local redb state store and
//! offers a few administrative commands over the same store.
//!
//! # Usage
//!
//! ```text
//! octorund run --config /etc/octorun/octorun.toml
//! octorund apply -f builders.json
//! octorund get ci/builders
//! octorund rollback ci/builders --revision 3
//! ```
//!
//! The store is a single-writer database: the administrative commands
//! open it directly and therefore run while the daemon is stopped.

mod commands;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use octorun_controller::{Controller, ControllerSettings, StoreEventRecorder};
use octorun_core::OctorunConfig;
use octorun_core::config::LogConfig;
use octorun_state::{ObjectKey, StateStore};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "octorund", about = "octorun RunnerSet controller daemon", version)]
struct Cli {
    /// Path to the TOML config file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override `store.data_dir` from the config.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run,
    /// Create a runner set, or update the spec of an existing one.
    Apply {
        /// JSON manifest of the runner set.
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print a runner set with its runners and revisions as JSON.
    Get {
        /// `namespace/name` of the runner set.
        key: ObjectKey,
    },
    /// Restore a runner set's template from an earlier revision.
    Rollback {
        /// `namespace/name` of the runner set.
        key: ObjectKey,
        #[arg(long)]
        revision: i64,
    },
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log.filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<OctorunConfig> {
    let mut config = match path {
        Some(path) => OctorunConfig::from_file(path)?,
        None => OctorunConfig::default(),
    };
    if let Some(dir) = data_dir {
        config.store.data_dir = dir;
    }
    Ok(config)
}

fn open_store(config: &OctorunConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.store.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.data_dir)?;
    init_tracing(&config.log)?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Apply { file } => {
            let store = open_store(&config)?;
            let manifest = std::fs::read_to_string(&file)?;
            let (set, created) = commands::apply(&store, &manifest)?;
            let verb = if created { "created" } else { "configured" };
            println!("runnerset {} {verb}", set.metadata.key());
            Ok(())
        }
        Command::Get { key } => {
            let store = open_store(&config)?;
            let view = commands::get(&store, &key)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Command::Rollback { key, revision } => {
            let store = open_store(&config)?;
            commands::rollback(&store, &key, revision)?;
            println!("runnerset {key} rolled back to revision {revision}");
            Ok(())
        }
    }
}

async fn run(config: OctorunConfig) -> anyhow::Result<()> {
    info!("octorun daemon starting");

    let timings = config.timings()?;
    let store = open_store(&config)?;

    let recorder = Arc::new(StoreEventRecorder::new(
        store.clone(),
        &config.controller.field_owner,
    ));
    let settings = ControllerSettings::new(config.controller.workers, &timings);
    let controller = Controller::new(store, recorder, settings);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    controller.run(shutdown_rx).await;

    info!("octorun daemon stopped");
    Ok(())
}
