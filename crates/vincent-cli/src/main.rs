mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, state::StateSubcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "vincent-e2e",
    about = "Inspect and maintain the Vincent e2e state cache",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .e2e-state.json, .vincent-e2e.yaml or .git/)
    #[arg(long, global = true, env = "VINCENT_E2E_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the configuration hash for a set of abilities and policies
    Hash {
        /// Ability IPFS CID (repeat once per ability)
        #[arg(long = "ability", value_name = "CID")]
        abilities: Vec<String>,

        /// Comma-separated policy CIDs for the ability at the same position
        #[arg(long = "policies", value_name = "CIDS")]
        policies: Vec<String>,
    },

    /// Inspect or reset cached e2e state
    State {
        #[command(subcommand)]
        subcommand: StateSubcommand,
    },

    /// Show or validate the e2e configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    tracing::debug!(root = %root.display(), "resolved project root");

    let result = match cli.command {
        Commands::Hash {
            abilities,
            policies,
        } => cmd::hash::run(&abilities, &policies, cli.json),
        Commands::State { subcommand } => cmd::state::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// `RUST_LOG` when set, warnings otherwise.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}
