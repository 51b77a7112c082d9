use crate::cmd::config::load as load_config;
use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;
use std::path::Path;
use vincent_core::config::LitNetwork;
use vincent_core::resource::is_still_valid;
use vincent_core::state::{LoadOrigin, StateDocument, StateStore, TestFileState};
use vincent_core::{Scope, StateManager};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum StateSubcommand {
    /// Summarize every test file partition in the state file
    Show,

    /// List the accounts a test file would reuse on a network
    Accounts {
        /// Test file partition, e.g. "policy_e2e.rs"
        #[arg(long)]
        test_file: String,
        /// Override the configured network
        #[arg(long)]
        network: Option<String>,
    },

    /// List registered app versions
    Apps {
        /// Restrict to one test file partition
        #[arg(long)]
        test_file: Option<String>,
    },

    /// List cached PKPs and capacity credits with their validity
    Resources {
        /// Restrict to one test file partition
        #[arg(long)]
        test_file: Option<String>,
    },

    /// Drop one test file partition, or the whole state file
    Clear {
        /// Only drop this test file partition
        #[arg(long)]
        test_file: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: StateSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        StateSubcommand::Show => show(root, json),
        StateSubcommand::Accounts { test_file, network } => {
            accounts(root, &test_file, network.as_deref(), json)
        }
        StateSubcommand::Apps { test_file } => apps(root, test_file.as_deref(), json),
        StateSubcommand::Resources { test_file } => resources(root, test_file.as_deref(), json),
        StateSubcommand::Clear { test_file } => clear(root, test_file.as_deref()),
    }
}

fn open_store(root: &Path) -> anyhow::Result<(StateStore, StateDocument)> {
    let config = load_config(root)?;
    let store = StateStore::new(config.state_path(root));
    let loaded = store
        .load()
        .with_context(|| format!("failed to read {}", store.path().display()))?;
    match loaded.origin {
        LoadOrigin::VersionMismatch { found } => eprintln!(
            "warning: state file version {} is not supported, showing empty state",
            found.as_deref().unwrap_or("<none>")
        ),
        LoadOrigin::Unreadable => {
            eprintln!("warning: state file could not be parsed, showing empty state")
        }
        LoadOrigin::Existing | LoadOrigin::Missing => {}
    }
    Ok((store, loaded.document))
}

fn selected<'a>(
    doc: &'a StateDocument,
    test_file: Option<&'a str>,
) -> anyhow::Result<Vec<(&'a String, &'a TestFileState)>> {
    match test_file {
        None => Ok(doc.test_files.iter().collect()),
        Some(name) => doc
            .test_files
            .get_key_value(name)
            .map(|entry| vec![entry])
            .with_context(|| format!("no state for test file '{name}'")),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let (store, doc) = open_store(root)?;

    if json {
        return print_json(&doc);
    }

    println!("State file: {}", store.path().display());
    println!("Version:    {}", doc.version);
    if !doc.shared_accounts.is_empty()
        || !doc.shared_pkps.is_empty()
        || !doc.shared_capacity_credits.is_empty()
    {
        println!(
            "Legacy:     {} account set(s), {} PKP(s), {} credit(s) awaiting migration",
            doc.shared_accounts.len(),
            doc.shared_pkps.len(),
            doc.shared_capacity_credits.len()
        );
    }
    println!();

    if doc.test_files.is_empty() {
        println!("No test files.");
        return Ok(());
    }

    let rows = doc
        .test_files
        .iter()
        .map(|(name, tf)| {
            vec![
                name.clone(),
                tf.accounts.len().to_string(),
                tf.pkps.len().to_string(),
                tf.capacity_credits.len().to_string(),
                tf.configurations.len().to_string(),
                tf.app_versions.len().to_string(),
            ]
        })
        .collect();
    print_table(
        &["TEST FILE", "NETWORKS", "PKPS", "CREDITS", "CONFIGS", "APP VERSIONS"],
        rows,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// accounts
// ---------------------------------------------------------------------------

fn accounts(root: &Path, test_file: &str, network: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let network = match network {
        Some(n) => n.parse::<LitNetwork>()?,
        None => config.network,
    };

    let scope = Scope::new(network.as_str(), test_file, &[], &[]);
    let manager = StateManager::open(&config, root, scope).context("failed to open state")?;
    let accounts = manager.generated_accounts();

    if json {
        let list: Vec<_> = accounts
            .iter()
            .map(|(role, address)| serde_json::json!({ "role": role, "address": address }))
            .collect();
        return print_json(&list);
    }

    if accounts.is_empty() {
        println!("No accounts for {test_file} on {network}.");
        return Ok(());
    }
    let rows = accounts
        .into_iter()
        .map(|(role, address)| vec![role.to_string(), address])
        .collect();
    print_table(&["ROLE", "ADDRESS"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// apps
// ---------------------------------------------------------------------------

fn apps(root: &Path, test_file: Option<&str>, json: bool) -> anyhow::Result<()> {
    let (_, doc) = open_store(root)?;
    let partitions = selected(&doc, test_file)?;

    let versions: Vec<_> = partitions
        .iter()
        .flat_map(|(name, tf)| tf.app_versions.values().map(move |v| (*name, v)))
        .collect();

    if json {
        let list: Vec<_> = versions
            .iter()
            .map(|(name, v)| serde_json::json!({ "testFile": name, "appVersion": v }))
            .collect();
        return print_json(&list);
    }

    if versions.is_empty() {
        println!("No app versions.");
        return Ok(());
    }
    let rows = versions
        .into_iter()
        .map(|(name, v)| {
            vec![
                name.clone(),
                v.app_id.to_string(),
                v.app_version.to_string(),
                v.network.clone(),
                v.state.vincent_app.delegatee_address.clone(),
                v.ability_ipfs_cids.len().to_string(),
                v.state.pkp_app_permissions.len().to_string(),
            ]
        })
        .collect();
    print_table(
        &["TEST FILE", "APP", "VERSION", "NETWORK", "DELEGATEE", "ABILITIES", "PERMITS"],
        rows,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// resources
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceRow {
    test_file: String,
    kind: &'static str,
    network: String,
    token_id: String,
    expires_at: Option<DateTime<Utc>>,
    valid: bool,
}

fn resources(root: &Path, test_file: Option<&str>, json: bool) -> anyhow::Result<()> {
    let (_, doc) = open_store(root)?;
    let partitions = selected(&doc, test_file)?;
    let now = Utc::now();

    let mut list = Vec::new();
    for (name, tf) in &partitions {
        for (network, pkp) in &tf.pkps {
            list.push(ResourceRow {
                test_file: name.to_string(),
                kind: "pkp",
                network: network.clone(),
                token_id: pkp.info.token_id.clone(),
                expires_at: pkp.expires_at,
                valid: pkp.expires_at.map_or(true, |exp| is_still_valid(exp, now)),
            });
        }
        for (network, credit) in &tf.capacity_credits {
            list.push(ResourceRow {
                test_file: name.to_string(),
                kind: "capacity-credit",
                network: network.clone(),
                token_id: credit.info.capacity_token_id_str.clone(),
                expires_at: Some(credit.expires_at),
                valid: is_still_valid(credit.expires_at, now),
            });
        }
    }

    if json {
        return print_json(&list);
    }

    if list.is_empty() {
        println!("No cached resources.");
        return Ok(());
    }
    let rows = list
        .into_iter()
        .map(|r| {
            vec![
                r.test_file,
                r.kind.to_string(),
                r.network,
                r.token_id,
                r.expires_at.map_or_else(|| "-".to_string(), |e| e.to_rfc3339()),
                if r.valid { "yes" } else { "stale" }.to_string(),
            ]
        })
        .collect();
    print_table(
        &["TEST FILE", "KIND", "NETWORK", "TOKEN ID", "EXPIRES", "VALID"],
        rows,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// clear
// ---------------------------------------------------------------------------

fn clear(root: &Path, test_file: Option<&str>) -> anyhow::Result<()> {
    let (store, mut doc) = open_store(root)?;

    let Some(name) = test_file else {
        match std::fs::remove_file(store.path()) {
            Ok(()) => println!("Removed {}", store.path().display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                println!("Nothing to clear.")
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", store.path().display()))
            }
        }
        return Ok(());
    };

    if doc.test_files.remove(name).is_none() {
        anyhow::bail!("no state for test file '{name}'");
    }
    store.save(&doc).context("failed to save state")?;
    println!("Cleared state for {name}.");
    Ok(())
}
