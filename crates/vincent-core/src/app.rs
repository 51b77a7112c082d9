//! App registration reconciliation.
//!
//! The registry allows one app per delegatee, so every configuration that
//! uses the same delegatee must land on the same `app_id`. Within that app,
//! each exact ability/policy set maps to one app version; a new version is
//! only registered when no earlier version carries the requested sets.

use crate::error::{E2eError, OperationError, Result};
use crate::manager::StateManager;
use crate::params::PolicyParameters;
use crate::state::{
    app_version_key, AppVersionConfiguration, AppVersionSlot, Lookup, VincentAppRecord,
};
use std::future::Future;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// The configuration an app version is requested for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppRequest {
    pub ability_ids: Vec<String>,
    /// Policy identifiers per ability, index-aligned with `ability_ids`.
    pub policy_ids: Vec<Vec<String>>,
    pub parameters: PolicyParameters,
}

/// What a registration operation reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppVersionRef {
    pub app_id: u64,
    pub app_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppRegistration {
    pub app_id: u64,
    pub app_version: u64,
    pub is_new: bool,
    pub is_new_version: bool,
}

/// Which configuration slot an existing app record was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppSource {
    CurrentConfig,
    OtherConfig(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistingApp {
    pub record: VincentAppRecord,
    pub source: AppSource,
}

/// Abilities compare as sorted sets; the nested policy lists compare exactly
/// because a policy's position ties it to its ability.
pub fn identifiers_match(
    stored_abilities: &[String],
    stored_policies: &[Vec<String>],
    abilities: &[String],
    policies: &[Vec<String>],
) -> bool {
    let mut a = stored_abilities.to_vec();
    let mut b = abilities.to_vec();
    a.sort();
    b.sort();
    a == b && stored_policies == policies
}

// ---------------------------------------------------------------------------
// AppRegistrationReconciler
// ---------------------------------------------------------------------------

impl StateManager {
    /// Find the app registered by `delegatee` on this network: first in the
    /// current configuration slot, then in any other slot of the test file.
    pub fn existing_app(&self, delegatee: &str) -> Lookup<ExistingApp> {
        let network = &self.scope().network;
        let owned_by = |app: &VincentAppRecord| {
            app.network == *network && app.delegatee_address == delegatee
        };

        if let Some(app) = self
            .current_config()
            .and_then(|c| c.state.vincent_app.as_ref())
            .filter(|&app| owned_by(app))
        {
            return Lookup::Found(ExistingApp {
                record: app.clone(),
                source: AppSource::CurrentConfig,
            });
        }

        let current = &self.scope().config_hash;
        self.test_file()
            .into_iter()
            .flat_map(|tf| tf.configurations.iter())
            .filter(|(hash, _)| *hash != current)
            .find_map(|(hash, config)| {
                config
                    .state
                    .vincent_app
                    .as_ref()
                    .filter(|&app| owned_by(app))
                    .map(|app| ExistingApp {
                        record: app.clone(),
                        source: AppSource::OtherConfig(hash.clone()),
                    })
            })
            .into()
    }

    /// Resolve the app version for `request`, registering only what the
    /// cache cannot supply.
    ///
    /// - no app for the delegatee: `register()` is called and the result is
    ///   recorded as both an app version and the current slot's app;
    /// - app known and some version carries exactly the requested
    ///   identifiers: that version is reused;
    /// - app known, no matching version: `register_next_version(app_id)`.
    ///
    /// Nothing is saved if a registration operation fails.
    pub async fn get_or_register_app<R, RFut, RE, N, NFut, NE>(
        &mut self,
        delegatee: &str,
        register: R,
        register_next_version: N,
        request: &AppRequest,
    ) -> Result<AppRegistration>
    where
        R: FnOnce() -> RFut,
        RFut: Future<Output = std::result::Result<AppVersionRef, RE>>,
        RE: Into<OperationError>,
        N: FnOnce(u64) -> NFut,
        NFut: Future<Output = std::result::Result<AppVersionRef, NE>>,
        NE: Into<OperationError>,
    {
        let existing = match self.existing_app(delegatee) {
            Lookup::Found(existing) => existing,
            Lookup::NotFound => {
                tracing::info!(%delegatee, "registering new Vincent app");
                let registered = register()
                    .await
                    .map_err(|e| E2eError::operation("register app", e))?;

                let record = self.app_record(registered, delegatee, request);
                self.store_app_version(&record);
                self.current_config_mut().state.vincent_app = Some(record);
                self.save()?;
                tracing::info!(
                    app_id = registered.app_id,
                    app_version = registered.app_version,
                    "saved new Vincent app"
                );
                return Ok(AppRegistration {
                    app_id: registered.app_id,
                    app_version: registered.app_version,
                    is_new: true,
                    is_new_version: false,
                });
            }
        };

        let app_id = existing.record.app_id;
        if let AppSource::OtherConfig(hash) = &existing.source {
            tracing::warn!(
                app_id,
                from_config = %hash,
                to_config = %self.scope().config_hash,
                "reusing app registered under a different configuration"
            );
        }

        if let Some(matched) = self.find_matching_version(app_id, request) {
            let app_version = matched.app_version;
            tracing::info!(app_id, app_version, "using existing app version");

            let current = self
                .current_config()
                .and_then(|c| c.state.vincent_app.as_ref())
                .map(|app| (app.app_id, app.app_version));
            if current != Some((app_id, app_version)) {
                let now = self.now();
                self.current_config_mut().state.vincent_app = Some(VincentAppRecord {
                    created_at: now,
                    ..matched
                });
                self.save()?;
            }
            return Ok(AppRegistration {
                app_id,
                app_version,
                is_new: false,
                is_new_version: false,
            });
        }

        tracing::info!(app_id, "registering new version for existing app");
        let registered = register_next_version(app_id)
            .await
            .map_err(|e| E2eError::operation("register next app version", e))?;

        let record = self.app_record(
            AppVersionRef {
                app_id,
                app_version: registered.app_version,
            },
            delegatee,
            request,
        );
        self.store_app_version(&record);
        self.current_config_mut().state.vincent_app = Some(record);
        self.save()?;

        Ok(AppRegistration {
            app_id,
            app_version: registered.app_version,
            is_new: false,
            is_new_version: true,
        })
    }

    /// Record the parameter values used with `app_id` on the current slot.
    /// Returns false when the slot holds no such app.
    pub fn update_app_parameter_values(
        &mut self,
        app_id: u64,
        values: Vec<Vec<String>>,
    ) -> Result<bool> {
        let slot = self.current_config_mut();
        let Some(app) = slot.state.vincent_app.as_mut().filter(|a| a.app_id == app_id) else {
            return Ok(false);
        };
        app.parameters.values = Some(values);
        self.save()?;
        Ok(true)
    }

    fn find_matching_version(&self, app_id: u64, request: &AppRequest) -> Option<VincentAppRecord> {
        let network = &self.scope().network;
        let matches = |abilities: &[String], policies: &[Vec<String>]| {
            identifiers_match(abilities, policies, &request.ability_ids, &request.policy_ids)
        };

        let from_versions = self.test_file().and_then(|tf| {
            tf.app_versions
                .values()
                .filter(|v| v.app_id == app_id && v.network == *network)
                .find(|v| matches(v.ability_ipfs_cids.as_slice(), v.ability_policy_cids.as_slice()))
                .map(|v| v.state.vincent_app.clone())
        });
        if from_versions.is_some() {
            return from_versions;
        }

        // Slot records written before app versions were tracked.
        self.current_config()
            .and_then(|c| c.state.vincent_app.as_ref())
            .filter(|app| app.app_id == app_id && app.network == *network)
            .filter(|app| matches(app.ability_ipfs_cids.as_slice(), app.ability_policies.as_slice()))
            .cloned()
    }

    fn app_record(
        &self,
        registered: AppVersionRef,
        delegatee: &str,
        request: &AppRequest,
    ) -> VincentAppRecord {
        VincentAppRecord {
            app_id: registered.app_id,
            app_version: registered.app_version,
            created_at: self.now(),
            network: self.scope().network.clone(),
            delegatee_address: delegatee.to_string(),
            ability_ipfs_cids: request.ability_ids.clone(),
            ability_policies: request.policy_ids.clone(),
            parameters: request.parameters.clone(),
        }
    }

    fn store_app_version(&mut self, record: &VincentAppRecord) {
        let key = app_version_key(record.app_id, record.app_version);
        let entry = AppVersionConfiguration {
            app_id: record.app_id,
            app_version: record.app_version,
            ability_ipfs_cids: record.ability_ipfs_cids.clone(),
            ability_policy_cids: record.ability_policies.clone(),
            last_used: record.created_at,
            network: record.network.clone(),
            state: AppVersionSlot {
                vincent_app: record.clone(),
                pkp_app_permissions: Vec::new(),
            },
        };
        self.test_file_mut().app_versions.insert(key.clone(), entry);
        tracing::debug!(%key, "saved app version configuration");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
