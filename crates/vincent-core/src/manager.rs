use crate::clock::{Clock, SystemClock};
use crate::config::{E2eConfig, KeyOverrides};
use crate::config_hash::compute_config_hash;
use crate::error::Result;
use crate::paths;
use crate::state::{
    ConfigurationState, LoadOrigin, StateDocument, StateStore, TestFileState,
};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Which partition of the state document a manager reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub network: String,
    pub test_file: String,
    pub config_hash: String,
}

impl Scope {
    pub fn new(
        network: impl Into<String>,
        test_file: impl Into<String>,
        ability_ids: &[String],
        policy_ids: &[Vec<String>],
    ) -> Self {
        Self {
            network: network.into(),
            test_file: test_file.into(),
            config_hash: compute_config_hash(ability_ids, policy_ids),
        }
    }

    /// Like [`Scope::new`], with the test file taken from the caller's
    /// source location.
    #[track_caller]
    pub fn detect(
        network: impl Into<String>,
        ability_ids: &[String],
        policy_ids: &[Vec<String>],
    ) -> Self {
        let test_file = paths::caller_test_file();
        Self::new(network, test_file, ability_ids, policy_ids)
    }
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Owns the loaded state document for one scope. Reconciler operations live
/// in the `account`, `resource`, `app` and `permission` modules.
pub struct StateManager {
    store: StateStore,
    document: StateDocument,
    scope: Scope,
    keys: KeyOverrides,
    clock: Arc<dyn Clock>,
}

impl StateManager {
    /// Load the state file named by `config` under `root`.
    pub fn open(config: &E2eConfig, root: &Path, scope: Scope) -> Result<Self> {
        let store = StateStore::new(config.state_path(root));
        let mut manager = Self::with_store(store, scope)?;
        manager.keys = config.keys.clone();
        Ok(manager)
    }

    pub fn with_store(store: StateStore, scope: Scope) -> Result<Self> {
        let loaded = store.load()?;
        if loaded.origin == LoadOrigin::Existing {
            tracing::info!(
                test_file = %scope.test_file,
                config_hash = %scope.config_hash,
                "loaded existing e2e state"
            );
        }
        let mut manager = Self {
            store,
            document: loaded.document,
            scope,
            keys: KeyOverrides::default(),
            clock: Arc::new(SystemClock),
        };
        manager.ensure_current_config();
        Ok(manager)
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn document(&self) -> &StateDocument {
        &self.document
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub(crate) fn keys(&self) -> &KeyOverrides {
        &self.keys
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Switch to the configuration slot for these identifiers and record
    /// them as the slot's metadata.
    pub fn set_configuration(&mut self, ability_ids: &[String], policy_ids: &[Vec<String>]) {
        let hash = compute_config_hash(ability_ids, policy_ids);
        if hash != self.scope.config_hash {
            tracing::info!(from = %self.scope.config_hash, to = %hash, "switching configuration");
            self.scope.config_hash = hash;
        }
        let now = self.now();
        let slot = self.current_config_mut();
        slot.ability_ipfs_cids = ability_ids.to_vec();
        slot.ability_policy_cids = policy_ids.to_vec();
        slot.last_used = now;
    }

    /// Persist the whole document, stamping the current slot as used.
    pub fn save(&mut self) -> Result<()> {
        let now = self.now();
        self.current_config_mut().last_used = now;
        self.store.save(&self.document)?;
        tracing::debug!(
            test_file = %self.scope.test_file,
            config_hash = %self.scope.config_hash,
            "saved e2e state"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Slot access
    // -----------------------------------------------------------------------

    pub(crate) fn test_file(&self) -> Option<&TestFileState> {
        self.document.test_file(&self.scope.test_file)
    }

    pub(crate) fn test_file_mut(&mut self) -> &mut TestFileState {
        self.document.test_file_mut(&self.scope.test_file)
    }

    pub fn current_config(&self) -> Option<&ConfigurationState> {
        self.test_file()?.configurations.get(&self.scope.config_hash)
    }

    pub(crate) fn current_config_mut(&mut self) -> &mut ConfigurationState {
        let hash = self.scope.config_hash.clone();
        let network = self.scope.network.clone();
        let now = self.now();
        self.test_file_mut()
            .configurations
            .entry(hash.clone())
            .or_insert_with(|| ConfigurationState::new(hash, network, now))
    }

    fn ensure_current_config(&mut self) {
        self.current_config_mut();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
