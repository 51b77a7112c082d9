use crate::account::AccountRole;
use crate::error::Result;
use crate::params::PolicyParameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Schema tag written into every state file. Documents carrying any other
/// tag are discarded on load.
pub const STATE_VERSION: &str = "2.0.0";

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Result of a cache lookup. "Not found" is an ordinary outcome, distinct
/// from an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }
}

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// App ids and versions are written as decimal strings. Files holding plain
/// JSON numbers load as well.
mod decimal_id {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        deserializer.deserialize_any(IdVisitor)
    }

    struct IdVisitor;

    impl<'de> Visitor<'de> for IdVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an unsigned integer or a decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.trim()
                .parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub private_key: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub network: String,
}

/// The accounts held for one network, one slot per role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_manager: Option<AccountRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_delegatee: Option<AccountRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_wallet_pkp_owner: Option<AccountRecord>,
}

impl AccountSet {
    pub fn get(&self, role: AccountRole) -> Option<&AccountRecord> {
        match role {
            AccountRole::AppManager => self.app_manager.as_ref(),
            AccountRole::AppDelegatee => self.app_delegatee.as_ref(),
            AccountRole::AgentWalletPkpOwner => self.agent_wallet_pkp_owner.as_ref(),
        }
    }

    pub fn set(&mut self, role: AccountRole, record: AccountRecord) {
        let slot = match role {
            AccountRole::AppManager => &mut self.app_manager,
            AccountRole::AppDelegatee => &mut self.app_delegatee,
            AccountRole::AgentWalletPkpOwner => &mut self.agent_wallet_pkp_owner,
        };
        *slot = Some(record);
    }
}

/// What a PKP mint returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkpInfo {
    pub token_id: String,
    pub public_key: String,
    pub eth_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkpRecord {
    #[serde(flatten)]
    pub info: PkpInfo,
    pub created_at: DateTime<Utc>,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// What a capacity credit mint returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityCreditInfo {
    pub capacity_token_id_str: String,
    pub capacity_token_id: String,
    pub requests_per_kilosecond: u64,
    #[serde(rename = "daysUntilUTCMidnightExpiration")]
    pub days_until_utc_midnight_expiration: u32,
    pub minted_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityCreditRecord {
    #[serde(flatten)]
    pub info: CapacityCreditInfo,
    pub network: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VincentAppRecord {
    #[serde(with = "decimal_id")]
    pub app_id: u64,
    #[serde(with = "decimal_id")]
    pub app_version: u64,
    pub created_at: DateTime<Utc>,
    pub network: String,
    pub delegatee_address: String,
    pub ability_ipfs_cids: Vec<String>,
    pub ability_policies: Vec<Vec<String>>,
    #[serde(flatten)]
    pub parameters: PolicyParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    pub pkp_token_id: String,
    #[serde(with = "decimal_id")]
    pub app_id: u64,
    #[serde(with = "decimal_id")]
    pub app_version: u64,
    pub permitted_at: DateTime<Utc>,
    pub network: String,
}

impl PermissionRecord {
    pub fn matches(&self, pkp_token_id: &str, app_id: u64, app_version: u64, network: &str) -> bool {
        self.pkp_token_id == pkp_token_id
            && self.app_id == app_id
            && self.app_version == app_version
            && self.network == network
    }
}

// ---------------------------------------------------------------------------
// Configuration slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSlot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vincent_app: Option<VincentAppRecord>,
    #[serde(default)]
    pub pkp_app_permissions: Vec<PermissionRecord>,
}

/// Cache entry for one ability/policy configuration, keyed by its hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationState {
    pub config_hash: String,
    #[serde(default)]
    pub ability_ipfs_cids: Vec<String>,
    #[serde(default)]
    pub ability_policy_cids: Vec<Vec<String>>,
    pub last_used: DateTime<Utc>,
    pub network: String,
    #[serde(default)]
    pub state: ConfigurationSlot,
}

impl ConfigurationState {
    pub fn new(
        config_hash: impl Into<String>,
        network: impl Into<String>,
        last_used: DateTime<Utc>,
    ) -> Self {
        Self {
            config_hash: config_hash.into(),
            ability_ipfs_cids: Vec::new(),
            ability_policy_cids: Vec::new(),
            last_used,
            network: network.into(),
            state: ConfigurationSlot::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppVersionSlot {
    pub vincent_app: VincentAppRecord,
    #[serde(default)]
    pub pkp_app_permissions: Vec<PermissionRecord>,
}

/// One registered app version and the exact identifier sets it was
/// registered with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppVersionConfiguration {
    #[serde(with = "decimal_id")]
    pub app_id: u64,
    #[serde(with = "decimal_id")]
    pub app_version: u64,
    pub ability_ipfs_cids: Vec<String>,
    pub ability_policy_cids: Vec<Vec<String>>,
    pub last_used: DateTime<Utc>,
    pub network: String,
    pub state: AppVersionSlot,
}

pub fn app_version_key(app_id: u64, app_version: u64) -> String {
    format!("{app_id}-{app_version}")
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Everything cached for one test file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFileState {
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountSet>,
    #[serde(default)]
    pub pkps: BTreeMap<String, PkpRecord>,
    #[serde(default)]
    pub capacity_credits: BTreeMap<String, CapacityCreditRecord>,
    #[serde(default)]
    pub configurations: BTreeMap<String, ConfigurationState>,
    #[serde(default)]
    pub app_versions: BTreeMap<String, AppVersionConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    pub version: String,
    /// Pre-partitioning layout where every test file shared one set of
    /// accounts and resources per network. Read for migration only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shared_accounts: BTreeMap<String, AccountSet>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shared_pkps: BTreeMap<String, PkpRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shared_capacity_credits: BTreeMap<String, CapacityCreditRecord>,
    #[serde(default)]
    pub test_files: BTreeMap<String, TestFileState>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            shared_accounts: BTreeMap::new(),
            shared_pkps: BTreeMap::new(),
            shared_capacity_credits: BTreeMap::new(),
            test_files: BTreeMap::new(),
        }
    }
}

impl StateDocument {
    pub fn test_file(&self, name: &str) -> Option<&TestFileState> {
        self.test_files.get(name)
    }

    pub fn test_file_mut(&mut self, name: &str) -> &mut TestFileState {
        self.test_files.entry(name.to_string()).or_default()
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// How a loaded document came to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOrigin {
    Existing,
    Missing,
    VersionMismatch { found: Option<String> },
    Unreadable,
}

#[derive(Debug, Clone)]
pub struct Loaded {
    pub document: StateDocument,
    pub origin: LoadOrigin,
}

/// The JSON file holding a [`StateDocument`]. Single writer: concurrent runs
/// against the same file are not coordinated.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing, unparsable or differently-versioned file
    /// yields a fresh document. A file with the current version tag whose
    /// records do not decode is an error, so it is never overwritten.
    pub fn load(&self) -> Result<Loaded> {
        let Some(data) = crate::io::read_if_exists(&self.path)? else {
            tracing::info!(path = %self.path.display(), "no existing state file, will create one");
            return Ok(Self::fresh(LoadOrigin::Missing));
        };

        let value: serde_json::Value = match serde_json::from_str(&data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "state file is not valid JSON, starting fresh");
                return Ok(Self::fresh(LoadOrigin::Unreadable));
            }
        };

        let found = value
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if found.as_deref() != Some(STATE_VERSION) {
            tracing::warn!(
                expected = STATE_VERSION,
                found = found.as_deref().unwrap_or("<none>"),
                "state file version mismatch, starting fresh"
            );
            return Ok(Self::fresh(LoadOrigin::VersionMismatch { found }));
        }

        match serde_json::from_value::<StateDocument>(value) {
            Ok(document) => Ok(Loaded {
                document,
                origin: LoadOrigin::Existing,
            }),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "state file does not match schema");
                Err(e.into())
            }
        }
    }

    /// Rewrite the whole document. Failures surface to the caller.
    pub fn save(&self, document: &StateDocument) -> Result<()> {
        let data = serde_json::to_string_pretty(document)?;
        crate::io::atomic_write(&self.path, data.as_bytes())
    }

    fn fresh(origin: LoadOrigin) -> Loaded {
        Loaded {
            document: StateDocument::default(),
            origin,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join(".e2e-state.json"))
    }

    #[test]
    fn missing_file_is_fresh_document() {
        let dir = TempDir::new().unwrap();
        let loaded = store(&dir).load().unwrap();
        assert_eq!(loaded.origin, LoadOrigin::Missing);
        assert_eq!(loaded.document, StateDocument::default());
    }

    #[test]
    fn version_mismatch_discards_document() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".e2e-state.json"),
            r#"{"version":"1.0.0","testFiles":{"a.rs":{}}}"#,
        )
        .unwrap();
        let loaded = store(&dir).load().unwrap();
        assert_eq!(
            loaded.origin,
            LoadOrigin::VersionMismatch {
                found: Some("1.0.0".to_string())
            }
        );
        assert!(loaded.document.test_files.is_empty());
    }

    #[test]
    fn garbage_is_fresh_document() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".e2e-state.json"), "not json").unwrap();
        let loaded = store(&dir).load().unwrap();
        assert_eq!(loaded.origin, LoadOrigin::Unreadable);
    }

    /// A file as written by the JavaScript tooling: ids as decimal strings.
    const STRING_ID_STATE: &str = r#"{
      "version": "2.0.0",
      "testFiles": {
        "swap.spec.ts": {
          "accounts": {
            "datil": {
              "appDelegatee": {
                "privateKey": "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
                "address": "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC",
                "createdAt": "2025-01-01T00:00:00.000Z",
                "network": "datil"
              }
            }
          },
          "configurations": {
            "ba7816bf": {
              "configHash": "ba7816bf",
              "abilityIpfsCids": ["QmA"],
              "abilityPolicyCids": [["QmP"]],
              "lastUsed": "2025-01-02T00:00:00.000Z",
              "network": "datil",
              "state": {
                "vincentApp": {
                  "appId": "42",
                  "appVersion": "1",
                  "createdAt": "2025-01-01T00:00:00.000Z",
                  "network": "datil",
                  "delegateeAddress": "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC",
                  "abilityIpfsCids": ["QmA"],
                  "abilityPolicies": [["QmP"]]
                },
                "pkpAppPermissions": [
                  {
                    "pkpTokenId": "0xpkp",
                    "appId": "42",
                    "appVersion": "1",
                    "permittedAt": "2025-01-01T00:00:00.000Z",
                    "network": "datil"
                  }
                ]
              }
            }
          },
          "appVersions": {
            "42-1": {
              "appId": "42",
              "appVersion": "1",
              "abilityIpfsCids": ["QmA"],
              "abilityPolicyCids": [["QmP"]],
              "lastUsed": "2025-01-02T00:00:00.000Z",
              "network": "datil",
              "state": {
                "vincentApp": {
                  "appId": "42",
                  "appVersion": "1",
                  "createdAt": "2025-01-01T00:00:00.000Z",
                  "network": "datil",
                  "delegateeAddress": "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC",
                  "abilityIpfsCids": ["QmA"],
                  "abilityPolicies": [["QmP"]]
                },
                "pkpAppPermissions": []
              }
            }
          }
        }
      }
    }"#;

    #[test]
    fn string_ids_load_and_keep_their_records() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".e2e-state.json"), STRING_ID_STATE).unwrap();

        let loaded = store(&dir).load().unwrap();
        assert_eq!(loaded.origin, LoadOrigin::Existing);
        let tf = &loaded.document.test_files["swap.spec.ts"];
        let version = &tf.app_versions["42-1"];
        assert_eq!((version.app_id, version.app_version), (42, 1));
        let slot = &tf.configurations["ba7816bf"].state;
        assert_eq!(slot.vincent_app.as_ref().unwrap().app_id, 42);
        assert!(slot.pkp_app_permissions[0].matches("0xpkp", 42, 1, "datil"));
    }

    #[test]
    fn string_id_file_keeps_cached_account() {
        use crate::account::AccountRole;
        use crate::config::E2eConfig;
        use crate::manager::{Scope, StateManager};

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".e2e-state.json"), STRING_ID_STATE).unwrap();

        let scope = Scope::new("datil", "swap.spec.ts", &[], &[]);
        let mut mgr = StateManager::open(&E2eConfig::default(), dir.path(), scope).unwrap();
        let delegatee = mgr
            .get_or_generate_account(AccountRole::AppDelegatee, None)
            .unwrap();
        assert!(!delegatee.is_new);
        assert_eq!(delegatee.address, "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC");

        mgr.save().unwrap();
        let reloaded = store(&dir).load().unwrap().document;
        assert!(reloaded.test_files["swap.spec.ts"]
            .app_versions
            .contains_key("42-1"));
    }

    #[test]
    fn ids_are_written_as_decimal_strings() {
        let record = PermissionRecord {
            pkp_token_id: "1".into(),
            app_id: 42,
            app_version: 3,
            permitted_at: Utc::now(),
            network: "datil".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["appId"], "42");
        assert_eq!(json["appVersion"], "3");

        let mut numeric = json.clone();
        numeric["appId"] = serde_json::json!(42);
        let back: PermissionRecord = serde_json::from_value(numeric).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn schema_mismatch_is_an_error_and_file_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".e2e-state.json");
        let raw = r#"{"version":"2.0.0","testFiles":{"a.rs":{"appVersions":{"1-1":{"appId":"one"}}}}}"#;
        std::fs::write(&path, raw).unwrap();

        let err = store(&dir).load().unwrap_err();
        assert!(matches!(err, crate::error::E2eError::Json(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), raw);
    }

    #[test]
    fn save_then_load_keeps_partitions() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        let mut doc = StateDocument::default();
        doc.test_file_mut("transfer.rs")
            .configurations
            .insert("deadbeef".into(), ConfigurationState::new("deadbeef", "datil", Utc::now()));
        s.save(&doc).unwrap();

        let loaded = s.load().unwrap();
        assert_eq!(loaded.origin, LoadOrigin::Existing);
        assert!(loaded.document.test_files["transfer.rs"]
            .configurations
            .contains_key("deadbeef"));
    }

    #[test]
    fn json_uses_camel_case_layout() {
        let mut doc = StateDocument::default();
        let tf = doc.test_file_mut("a.rs");
        tf.capacity_credits.insert(
            "datil".into(),
            CapacityCreditRecord {
                info: CapacityCreditInfo {
                    capacity_token_id_str: "7".into(),
                    capacity_token_id: "7".into(),
                    requests_per_kilosecond: 80,
                    days_until_utc_midnight_expiration: 25,
                    minted_at_utc: Utc::now(),
                },
                network: "datil".into(),
                expires_at: Utc::now(),
            },
        );
        let json = serde_json::to_value(&doc).unwrap();
        let cc = &json["testFiles"]["a.rs"]["capacityCredits"]["datil"];
        assert_eq!(cc["capacityTokenIdStr"], "7");
        assert_eq!(cc["daysUntilUTCMidnightExpiration"], 25);
        assert!(cc.get("expiresAt").is_some());
        assert!(json.get("sharedAccounts").is_none());
    }

    #[test]
    fn save_into_missing_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let s = StateStore::new(dir.path().join("nested/.e2e-state.json"));
        s.save(&StateDocument::default()).unwrap();
        assert!(s.path().exists());
    }

    #[test]
    fn lookup_from_option() {
        assert_eq!(Lookup::from(Some(3)), Lookup::Found(3));
        assert!(!Lookup::<u8>::from(None).is_found());
    }

    #[test]
    fn app_version_key_format() {
        assert_eq!(app_version_key(42, 1), "42-1");
    }
}
