use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use fleet_core::FleetConfig;
use fleet_state::StateStore;

mod commands;

#[derive(Parser)]
#[command(
    name = "fleetctl",
    about = "Fleet: TiP node allocation and provisioning",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to fleet.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// redb database file (overrides [store].path)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Candidate entity pool of an experiment
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// Entities provisioned to an experiment
    Provisioned {
        #[command(subcommand)]
        action: ShowAction,
    },
    /// Persisted step state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Dry-run the affinity selector against a stored pool.
    ///
    /// Nothing is requested and nothing is written.
    Plan {
        #[arg(short, long)]
        experiment: String,
        /// Experiment groups, comma separated, in declaration order
        #[arg(short, long, value_delimiter = ',', required = true)]
        groups: Vec<String>,
        /// Any, SameCluster, SameRack or DifferentCluster
        #[arg(short, long, default_value = "Any")]
        affinity: String,
        /// Nodes per group
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    /// Replace an experiment's pool with entities from a JSON file
    Import {
        #[arg(short, long)]
        experiment: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print an experiment's pool
    Show {
        #[arg(short, long)]
        experiment: String,
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ShowAction {
    Show {
        #[arg(short, long)]
        experiment: String,
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the state of one step, or list the state keys of an experiment
    Show {
        #[arg(short, long)]
        experiment: String,
        #[arg(short, long)]
        step: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };
    let store_path = cli
        .store
        .clone()
        .or_else(|| config.store_path().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("fleet.redb"));
    debug!(store = %store_path.display(), "opening state store");
    let store = StateStore::open(&store_path)?;

    match cli.command {
        Commands::Pool { action } => match action {
            PoolAction::Import { experiment, file } => {
                commands::entities::import_pool(&store, &experiment, &file)
            }
            PoolAction::Show { experiment, format } => {
                commands::entities::show_pool(&store, &experiment, &format)
            }
        },
        Commands::Provisioned { action } => match action {
            ShowAction::Show { experiment, format } => {
                commands::entities::show_provisioned(&store, &experiment, &format)
            }
        },
        Commands::State { action } => match action {
            StateAction::Show { experiment, step } => {
                commands::state::show(&store, &experiment, step.as_deref())
            }
        },
        Commands::Plan {
            experiment,
            groups,
            affinity,
            count,
            format,
        } => commands::plan::plan(&store, &experiment, &groups, &affinity, count, &format),
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,fleet=debug"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
