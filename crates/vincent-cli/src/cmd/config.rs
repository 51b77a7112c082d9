use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use vincent_core::account::{derive_address, AccountRole};
use vincent_core::config::{E2eConfig, LitNetwork, WarnLevel};
use vincent_core::paths;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show the effective configuration (file + environment)
    Show,

    /// Validate the configuration for common mistakes
    Validate,

    /// Write a .vincent-e2e.yaml with defaults
    Init {
        /// Lit network: datil, datil-test or datil-dev
        #[arg(long, default_value = "datil")]
        network: String,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
        ConfigSubcommand::Init { network, force } => init(root, &network, force),
    }
}

pub fn load(root: &Path) -> anyhow::Result<E2eConfig> {
    E2eConfig::load_with_env(root).context("failed to load config")
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load(root)?;

    // Private keys are never printed; only the address they control.
    let keys: Vec<(AccountRole, String, String)> = AccountRole::ALL
        .into_iter()
        .map(|role| match config.keys.for_role(role) {
            Some(key) => {
                let address = derive_address(key).unwrap_or_else(|e| format!("invalid: {e}"));
                (role, "override".to_string(), address)
            }
            None => (role, "generated".to_string(), "-".to_string()),
        })
        .collect();

    if json {
        let key_values: serde_json::Map<String, serde_json::Value> = keys
            .iter()
            .map(|(role, source, address)| {
                (
                    role.as_str().to_string(),
                    serde_json::json!({ "source": source, "address": address }),
                )
            })
            .collect();
        print_json(&serde_json::json!({
            "network": config.network,
            "stateFile": config.state_path(root),
            "keys": key_values,
        }))?;
        return Ok(());
    }

    println!("Network:    {}", config.network);
    println!("State file: {}", config.state_path(root).display());
    println!();
    let rows = keys
        .into_iter()
        .map(|(role, source, address)| vec![role.to_string(), source, address])
        .collect();
    print_table(&["ROLE", "KEY", "ADDRESS"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load(root)?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init(root: &Path, network: &str, force: bool) -> anyhow::Result<()> {
    let path = paths::config_path(root);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let network: LitNetwork = network.parse()?;
    E2eConfig::new(network)
        .save(root)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
