use crate::error::{E2eError, OperationError, Result};
use crate::manager::StateManager;
use crate::state::PermissionRecord;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitOutcome {
    AlreadyPermitted,
    Permitted,
}

impl StateManager {
    /// Whether the current configuration already records `pkp_token_id` as
    /// permitted for this exact app version on this network.
    pub fn is_permitted(&self, pkp_token_id: &str, app_id: u64, app_version: u64) -> bool {
        let network = &self.scope().network;
        let found = self
            .current_config()
            .and_then(|c| {
                c.state
                    .pkp_app_permissions
                    .iter()
                    .find(|p| p.matches(pkp_token_id, app_id, app_version, network))
            });

        if let Some(p) = found {
            tracing::info!(
                pkp = pkp_token_id,
                app_id,
                app_version,
                permitted_at = %p.permitted_at,
                "PKP already permitted"
            );
        }
        found.is_some()
    }

    /// Upsert the permission tuple and save. An existing tuple is replaced in
    /// place with a fresh timestamp.
    pub fn record_permission(&mut self, pkp_token_id: &str, app_id: u64, app_version: u64) -> Result<()> {
        let network = self.scope().network.clone();
        let record = PermissionRecord {
            pkp_token_id: pkp_token_id.to_string(),
            app_id,
            app_version,
            permitted_at: self.now(),
            network: network.clone(),
        };

        let permissions = &mut self.current_config_mut().state.pkp_app_permissions;
        match permissions
            .iter_mut()
            .find(|p| p.matches(pkp_token_id, app_id, app_version, &network))
        {
            Some(existing) => *existing = record,
            None => permissions.push(record),
        }
        self.save()
    }

    /// Run `permit` unless the permission is already recorded.
    pub async fn permit_if_needed<F, Fut, T, E>(
        &mut self,
        pkp_token_id: &str,
        app_id: u64,
        app_version: u64,
        permit: F,
    ) -> Result<PermitOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<OperationError>,
    {
        if self.is_permitted(pkp_token_id, app_id, app_version) {
            return Ok(PermitOutcome::AlreadyPermitted);
        }
        permit()
            .await
            .map_err(|e| E2eError::operation("permit app version", e))?;
        self.record_permission(pkp_token_id, app_id, app_version)?;
        Ok(PermitOutcome::Permitted)
    }
}
