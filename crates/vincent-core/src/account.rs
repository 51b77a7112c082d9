use crate::error::{E2eError, Result};
use crate::manager::StateManager;
use crate::state::AccountRecord;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// AccountRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountRole {
    AppManager,
    AppDelegatee,
    AgentWalletPkpOwner,
}

impl AccountRole {
    pub const ALL: [AccountRole; 3] = [
        AccountRole::AppManager,
        AccountRole::AppDelegatee,
        AccountRole::AgentWalletPkpOwner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AccountRole::AppManager => "appManager",
            AccountRole::AppDelegatee => "appDelegatee",
            AccountRole::AgentWalletPkpOwner => "agentWalletPkpOwner",
        }
    }

    /// Environment variable that may supply this role's private key.
    pub fn env_var(self) -> &'static str {
        match self {
            AccountRole::AppManager => "TEST_APP_MANAGER_PRIVATE_KEY",
            AccountRole::AppDelegatee => "TEST_APP_DELEGATEE_PRIVATE_KEY",
            AccountRole::AgentWalletPkpOwner => "TEST_AGENT_WALLET_PKP_OWNER_PRIVATE_KEY",
        }
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        AccountRole::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown account role '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountHandle {
    pub private_key: String,
    pub address: String,
    pub is_new: bool,
}

/// EIP-55 address for a hex private key (with or without `0x`).
pub fn derive_address(private_key: &str) -> std::result::Result<String, String> {
    let signer = PrivateKeySigner::from_str(private_key).map_err(|e| e.to_string())?;
    Ok(checksum_address(&signer))
}

/// Fresh secp256k1 keypair as `(0x-private-key, checksummed-address)`.
pub fn generate_keypair() -> (String, String) {
    let signer = PrivateKeySigner::random();
    let private_key = format!("0x{}", hex::encode(signer.to_bytes()));
    (private_key, checksum_address(&signer))
}

fn checksum_address(signer: &PrivateKeySigner) -> String {
    Signer::address(signer).to_checksum(None)
}

// ---------------------------------------------------------------------------
// Funding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingReason {
    NewAccount,
    InsufficientBalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingDecision {
    Skip,
    Fund(FundingReason),
}

/// Whether an account must be topped up before a run. Amounts are in wei.
pub fn needs_funding(is_new: bool, balance: u128, target: u128) -> FundingDecision {
    if is_new && balance == 0 {
        FundingDecision::Fund(FundingReason::NewAccount)
    } else if balance < target {
        FundingDecision::Fund(FundingReason::InsufficientBalance)
    } else {
        FundingDecision::Skip
    }
}

// ---------------------------------------------------------------------------
// AccountCache
// ---------------------------------------------------------------------------

impl StateManager {
    /// Account for `role` using the configured key override, if any.
    pub fn account(&mut self, role: AccountRole) -> Result<AccountHandle> {
        let override_key = self.keys().for_role(role).map(str::to_string);
        self.get_or_generate_account(role, override_key.as_deref())
    }

    /// Resolve the keypair for `role`.
    ///
    /// An override key is used as-is and never cached. Otherwise the
    /// per-test-file record is reused, a legacy shared record is migrated, or
    /// a new keypair is generated and saved.
    pub fn get_or_generate_account(
        &mut self,
        role: AccountRole,
        override_key: Option<&str>,
    ) -> Result<AccountHandle> {
        if let Some(key) = override_key {
            let address = derive_address(key).map_err(|reason| E2eError::InvalidPrivateKey {
                role: role.to_string(),
                reason,
            })?;
            return Ok(AccountHandle {
                private_key: key.to_string(),
                address,
                is_new: false,
            });
        }

        let network = self.scope().network.clone();
        let test_file = self.scope().test_file.clone();

        let saved = self
            .test_file()
            .and_then(|tf| tf.accounts.get(&network))
            .and_then(|set| set.get(role))
            .filter(|a| a.network == network)
            .cloned();
        if let Some(account) = saved {
            tracing::info!(%role, %test_file, address = %account.address, "using cached account");
            return Ok(handle(&account, false));
        }

        let legacy = self
            .document()
            .shared_accounts
            .get(&network)
            .and_then(|set| set.get(role))
            .filter(|a| a.network == network)
            .cloned();
        if let Some(account) = legacy {
            tracing::warn!(%role, %test_file, address = %account.address, "migrating shared account");
            self.store_account(role, account.clone());
            self.save()?;
            return Ok(handle(&account, false));
        }

        tracing::info!(%role, %test_file, "generating new account");
        let (private_key, address) = generate_keypair();
        let account = AccountRecord {
            private_key,
            address,
            created_at: self.now(),
            network,
        };
        self.store_account(role, account.clone());
        self.save()?;
        Ok(handle(&account, true))
    }

    /// `(role, address)` for every account known on this network, legacy
    /// shared accounts included. Per-test-file records win.
    pub fn generated_accounts(&self) -> Vec<(AccountRole, String)> {
        let network = &self.scope().network;
        let local = self.test_file().and_then(|tf| tf.accounts.get(network));
        let shared = self.document().shared_accounts.get(network);

        AccountRole::ALL
            .into_iter()
            .filter_map(|role| {
                local
                    .and_then(|set| set.get(role))
                    .or_else(|| shared.and_then(|set| set.get(role)))
                    .map(|a| (role, a.address.clone()))
            })
            .collect()
    }

    fn store_account(&mut self, role: AccountRole, account: AccountRecord) {
        let network = self.scope().network.clone();
        self.test_file_mut()
            .accounts
            .entry(network)
            .or_default()
            .set(role, account);
    }
}

fn handle(account: &AccountRecord, is_new: bool) -> AccountHandle {
    AccountHandle {
        private_key: account.private_key.clone(),
        address: account.address.clone(),
        is_new,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::E2eConfig;
    use crate::manager::Scope;
    use crate::state::AccountSet;
    use chrono::Utc;
    use tempfile::TempDir;

    // Well-known development key (anvil account #1).
    const KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const ADDRESS: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    fn manager(dir: &TempDir) -> StateManager {
        let scope = Scope::new("datil", "accounts.rs", &[], &[]);
        StateManager::open(&E2eConfig::default(), dir.path(), scope).unwrap()
    }

    #[test]
    fn derive_address_is_checksummed() {
        assert_eq!(derive_address(KEY).unwrap(), ADDRESS);
        assert_eq!(derive_address(KEY.trim_start_matches("0x")).unwrap(), ADDRESS);
        assert!(derive_address("0x1234").is_err());
    }

    #[test]
    fn generated_keypair_is_consistent() {
        let (key, address) = generate_keypair();
        assert_eq!(key.len(), 66);
        assert_eq!(derive_address(&key).unwrap(), address);
    }

    #[test]
    fn override_key_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        let acct = mgr
            .get_or_generate_account(AccountRole::AppManager, Some(KEY))
            .unwrap();
        assert_eq!(acct.address, ADDRESS);
        assert!(!acct.is_new);
        assert!(mgr.generated_accounts().is_empty());
        assert!(!dir.path().join(".e2e-state.json").exists());
    }

    #[test]
    fn invalid_override_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        let err = mgr
            .get_or_generate_account(AccountRole::AppDelegatee, Some("nope"))
            .unwrap_err();
        assert!(matches!(err, E2eError::InvalidPrivateKey { .. }));
    }

    #[test]
    fn generated_account_is_reused_across_runs() {
        let dir = TempDir::new().unwrap();
        let first = manager(&dir)
            .get_or_generate_account(AccountRole::AppDelegatee, None)
            .unwrap();
        assert!(first.is_new);

        let second = manager(&dir)
            .get_or_generate_account(AccountRole::AppDelegatee, None)
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(first.address, second.address);
        assert_eq!(first.private_key, second.private_key);
    }

    #[test]
    fn roles_and_test_files_are_isolated() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        let a = mgr.get_or_generate_account(AccountRole::AppManager, None).unwrap();
        let b = mgr.get_or_generate_account(AccountRole::AppDelegatee, None).unwrap();
        assert_ne!(a.address, b.address);

        let scope = Scope::new("datil", "other.rs", &[], &[]);
        let mut other = StateManager::open(&E2eConfig::default(), dir.path(), scope).unwrap();
        let c = other.get_or_generate_account(AccountRole::AppManager, None).unwrap();
        assert!(c.is_new);
        assert_ne!(a.address, c.address);
    }

    #[test]
    fn legacy_shared_account_is_migrated() {
        let dir = TempDir::new().unwrap();
        let mut doc = crate::state::StateDocument::default();
        let mut set = AccountSet::default();
        set.set(
            AccountRole::AgentWalletPkpOwner,
            AccountRecord {
                private_key: KEY.into(),
                address: ADDRESS.into(),
                created_at: Utc::now(),
                network: "datil".into(),
            },
        );
        doc.shared_accounts.insert("datil".into(), set);
        crate::state::StateStore::new(dir.path().join(".e2e-state.json"))
            .save(&doc)
            .unwrap();

        let mut mgr = manager(&dir);
        let acct = mgr
            .get_or_generate_account(AccountRole::AgentWalletPkpOwner, None)
            .unwrap();
        assert!(!acct.is_new);
        assert_eq!(acct.address, ADDRESS);

        let local = &mgr.document().test_files["accounts.rs"].accounts["datil"];
        assert_eq!(local.agent_wallet_pkp_owner.as_ref().unwrap().address, ADDRESS);
        assert_eq!(
            mgr.generated_accounts(),
            vec![(AccountRole::AgentWalletPkpOwner, ADDRESS.to_string())]
        );
    }

    #[test]
    fn funding_rules() {
        assert_eq!(
            needs_funding(true, 0, 10),
            FundingDecision::Fund(FundingReason::NewAccount)
        );
        assert_eq!(
            needs_funding(false, 5, 10),
            FundingDecision::Fund(FundingReason::InsufficientBalance)
        );
        assert_eq!(needs_funding(true, 10, 10), FundingDecision::Skip);
        assert_eq!(needs_funding(false, 11, 10), FundingDecision::Skip);
    }

    #[test]
    fn role_parses_from_str() {
        assert_eq!("appDelegatee".parse::<AccountRole>().unwrap(), AccountRole::AppDelegatee);
        assert!("funder".parse::<AccountRole>().is_err());
    }
}
