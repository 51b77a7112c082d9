use crate::error::{E2eError, OperationError, Result};
use crate::manager::StateManager;
use crate::state::{CapacityCreditInfo, CapacityCreditRecord, Lookup, PkpInfo, PkpRecord};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, Utc};
use std::future::Future;

/// A cached resource is only reused if it outlives now by more than this.
pub const MIN_REMAINING_VALIDITY_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct Minted<T> {
    pub resource: T,
    pub is_new: bool,
}

/// True iff `expires_at` lies strictly more than 24 hours after `now`.
pub fn is_still_valid(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at > now + TimeDelta::hours(MIN_REMAINING_VALIDITY_HOURS)
}

/// Capacity credits expire at UTC midnight, `days` days after the mint date.
pub fn capacity_credit_expiry(info: &CapacityCreditInfo) -> DateTime<Utc> {
    info.minted_at_utc
        .date_naive()
        .checked_add_days(Days::new(u64::from(info.days_until_utc_midnight_expiration)))
        .unwrap_or(NaiveDate::MAX)
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Where a reused resource came from.
enum Hit<T> {
    Cached(T),
    Migrated(T),
}

impl StateManager {
    // -----------------------------------------------------------------------
    // PKP
    // -----------------------------------------------------------------------

    /// The cached PKP for this test file and network, migrating a legacy
    /// shared PKP into the test-file slot when needed.
    pub fn existing_pkp(&mut self) -> Lookup<PkpInfo> {
        self.find_pkp()
            .map(|hit| match hit {
                Hit::Cached(p) | Hit::Migrated(p) => p,
            })
            .into()
    }

    /// Return the cached PKP or mint one with `mint`. A mint failure leaves
    /// the state file untouched.
    pub async fn get_or_mint_pkp<F, Fut, E>(&mut self, mint: F) -> Result<Minted<PkpInfo>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<PkpInfo, E>>,
        E: Into<OperationError>,
    {
        match self.find_pkp() {
            Some(Hit::Cached(pkp)) => {
                return Ok(Minted {
                    resource: pkp,
                    is_new: false,
                })
            }
            Some(Hit::Migrated(pkp)) => {
                self.save()?;
                return Ok(Minted {
                    resource: pkp,
                    is_new: false,
                });
            }
            None => {}
        }

        tracing::info!(test_file = %self.scope().test_file, "minting new PKP");
        let pkp = mint()
            .await
            .map_err(|e| E2eError::operation("mint PKP", e))?;

        let record = PkpRecord {
            info: pkp.clone(),
            created_at: self.now(),
            network: self.scope().network.clone(),
            expires_at: None,
        };
        let network = self.scope().network.clone();
        self.test_file_mut().pkps.insert(network, record);
        self.save()?;
        tracing::info!(eth_address = %pkp.eth_address, "saved PKP");

        Ok(Minted {
            resource: pkp,
            is_new: true,
        })
    }

    fn find_pkp(&mut self) -> Option<Hit<PkpInfo>> {
        let network = self.scope().network.clone();
        let now = self.now();
        let fresh = |p: &PkpRecord| p.expires_at.map_or(true, |exp| is_still_valid(exp, now));

        if let Some(pkp) = self.test_file().and_then(|tf| tf.pkps.get(&network)) {
            if pkp.network != network {
                tracing::warn!(
                    eth_address = %pkp.info.eth_address,
                    recorded = %pkp.network,
                    expected = %network,
                    "cached PKP belongs to another network, ignoring"
                );
            } else if fresh(pkp) {
                tracing::info!(eth_address = %pkp.info.eth_address, "using cached PKP");
                return Some(Hit::Cached(pkp.info.clone()));
            } else {
                tracing::warn!(eth_address = %pkp.info.eth_address, "cached PKP expires within 24h, ignoring");
            }
        }

        let usable = |p: &PkpRecord| p.network == network && fresh(p);
        let legacy = self
            .document()
            .shared_pkps
            .get(&network)
            .filter(|&p| usable(p))
            .cloned()?;
        tracing::warn!(eth_address = %legacy.info.eth_address, "migrating shared PKP");
        let info = legacy.info.clone();
        self.test_file_mut().pkps.insert(network, legacy);
        Some(Hit::Migrated(info))
    }

    // -----------------------------------------------------------------------
    // Capacity credits
    // -----------------------------------------------------------------------

    /// Valid cached capacity credits for this test file and network. Credits
    /// expiring within 24 hours count as absent.
    pub fn existing_capacity_credits(&mut self) -> Lookup<CapacityCreditInfo> {
        self.find_capacity_credits()
            .map(|hit| match hit {
                Hit::Cached(c) | Hit::Migrated(c) => c,
            })
            .into()
    }

    /// Return valid cached capacity credits or mint new ones with `mint`.
    pub async fn get_or_mint_capacity_credits<F, Fut, E>(
        &mut self,
        mint: F,
    ) -> Result<Minted<CapacityCreditInfo>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CapacityCreditInfo, E>>,
        E: Into<OperationError>,
    {
        match self.find_capacity_credits() {
            Some(Hit::Cached(cc)) => {
                return Ok(Minted {
                    resource: cc,
                    is_new: false,
                })
            }
            Some(Hit::Migrated(cc)) => {
                self.save()?;
                return Ok(Minted {
                    resource: cc,
                    is_new: false,
                });
            }
            None => {}
        }

        tracing::info!(test_file = %self.scope().test_file, "minting new capacity credits");
        let cc = mint()
            .await
            .map_err(|e| E2eError::operation("mint capacity credits", e))?;

        let expires_at = capacity_credit_expiry(&cc);
        let network = self.scope().network.clone();
        let record = CapacityCreditRecord {
            info: cc.clone(),
            network: network.clone(),
            expires_at,
        };
        self.test_file_mut().capacity_credits.insert(network, record);
        self.save()?;
        tracing::info!(token_id = %cc.capacity_token_id_str, %expires_at, "saved capacity credits");

        Ok(Minted {
            resource: cc,
            is_new: true,
        })
    }

    fn find_capacity_credits(&mut self) -> Option<Hit<CapacityCreditInfo>> {
        let network = self.scope().network.clone();
        let now = self.now();

        if let Some(cc) = self
            .test_file()
            .and_then(|tf| tf.capacity_credits.get(&network))
            .filter(|cc| cc.network == network)
        {
            if is_still_valid(cc.expires_at, now) {
                tracing::info!(
                    token_id = %cc.info.capacity_token_id_str,
                    expires_at = %cc.expires_at,
                    "using cached capacity credits"
                );
                return Some(Hit::Cached(cc.info.clone()));
            }
            tracing::warn!(
                token_id = %cc.info.capacity_token_id_str,
                expires_at = %cc.expires_at,
                %now,
                "capacity credits expired or expiring within 24h"
            );
        }

        let legacy = self
            .document()
            .shared_capacity_credits
            .get(&network)
            .filter(|cc| cc.network == network && is_still_valid(cc.expires_at, now))
            .cloned()?;
        tracing::warn!(token_id = %legacy.info.capacity_token_id_str, "migrating shared capacity credits");
        let info = legacy.info.clone();
        self.test_file_mut().capacity_credits.insert(network, legacy);
        Some(Hit::Migrated(info))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::E2eConfig;
    use crate::manager::Scope;
    use crate::state::{StateDocument, StateStore};
    use chrono::TimeZone;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 15, 30, 0).unwrap()
    }

    fn manager(dir: &TempDir) -> StateManager {
        let scope = Scope::new("datil", "resources.rs", &[], &[]);
        StateManager::open(&E2eConfig::default(), dir.path(), scope)
            .unwrap()
            .with_clock(FixedClock(now()))
    }

    fn pkp(n: u8) -> PkpInfo {
        PkpInfo {
            token_id: n.to_string(),
            public_key: format!("0x04{n:02x}"),
            eth_address: format!("0x{n:040x}"),
        }
    }

    fn credits(minted: DateTime<Utc>, days: u32) -> CapacityCreditInfo {
        CapacityCreditInfo {
            capacity_token_id_str: "99".into(),
            capacity_token_id: "99".into(),
            requests_per_kilosecond: 80,
            days_until_utc_midnight_expiration: days,
            minted_at_utc: minted,
        }
    }

    fn seed_credits(dir: &TempDir, expires_at: DateTime<Utc>) {
        let mut doc = StateDocument::default();
        doc.test_file_mut("resources.rs").capacity_credits.insert(
            "datil".into(),
            CapacityCreditRecord {
                info: credits(now(), 1),
                network: "datil".into(),
                expires_at,
            },
        );
        StateStore::new(dir.path().join(".e2e-state.json"))
            .save(&doc)
            .unwrap();
    }

    #[test]
    fn expiry_is_utc_midnight_after_n_days() {
        let info = credits(now(), 25);
        assert_eq!(
            capacity_credit_expiry(&info),
            Utc.with_ymd_and_hms(2025, 4, 4, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn validity_boundary() {
        assert!(!is_still_valid(now() + TimeDelta::hours(23), now()));
        assert!(!is_still_valid(now() + TimeDelta::hours(24), now()));
        assert!(is_still_valid(now() + TimeDelta::hours(25), now()));
    }

    #[tokio::test]
    async fn pkp_is_minted_once() {
        let dir = TempDir::new().unwrap();
        let calls = Cell::new(0);

        let first = manager(&dir)
            .get_or_mint_pkp(|| async {
                calls.set(calls.get() + 1);
                Ok::<_, String>(pkp(1))
            })
            .await
            .unwrap();
        assert!(first.is_new);

        let second = manager(&dir)
            .get_or_mint_pkp(|| async {
                calls.set(calls.get() + 1);
                Ok::<_, String>(pkp(2))
            })
            .await
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.resource, pkp(1));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn failed_mint_saves_nothing() {
        let dir = TempDir::new().unwrap();
        let err = manager(&dir)
            .get_or_mint_pkp(|| async { Err::<PkpInfo, _>("rpc down") })
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::Operation { operation: "mint PKP", .. }));
        assert!(!dir.path().join(".e2e-state.json").exists());
    }

    #[tokio::test]
    async fn legacy_pkp_is_migrated() {
        let dir = TempDir::new().unwrap();
        let mut doc = StateDocument::default();
        doc.shared_pkps.insert(
            "datil".into(),
            PkpRecord {
                info: pkp(7),
                created_at: now(),
                network: "datil".into(),
                expires_at: None,
            },
        );
        StateStore::new(dir.path().join(".e2e-state.json"))
            .save(&doc)
            .unwrap();

        let mut mgr = manager(&dir);
        let got = mgr
            .get_or_mint_pkp(|| async { Err::<PkpInfo, _>("must not mint") })
            .await
            .unwrap();
        assert!(!got.is_new);
        assert_eq!(got.resource, pkp(7));

        let reloaded = StateStore::new(dir.path().join(".e2e-state.json"))
            .load()
            .unwrap();
        assert!(reloaded.document.test_files["resources.rs"].pkps.contains_key("datil"));
    }

    fn seed_pkp(dir: &TempDir, shared: bool, expires_at: DateTime<Utc>) {
        let record = PkpRecord {
            info: pkp(3),
            created_at: now(),
            network: "datil".into(),
            expires_at: Some(expires_at),
        };
        let mut doc = StateDocument::default();
        if shared {
            doc.shared_pkps.insert("datil".into(), record);
        } else {
            doc.test_file_mut("resources.rs").pkps.insert("datil".into(), record);
        }
        StateStore::new(dir.path().join(".e2e-state.json"))
            .save(&doc)
            .unwrap();
    }

    #[tokio::test]
    async fn pkp_expiring_in_23_hours_is_reminted() {
        let dir = TempDir::new().unwrap();
        seed_pkp(&dir, false, now() + TimeDelta::hours(23));

        let mut mgr = manager(&dir);
        assert_eq!(mgr.existing_pkp(), Lookup::NotFound);
        let got = mgr
            .get_or_mint_pkp(|| async { Ok::<_, String>(pkp(4)) })
            .await
            .unwrap();
        assert!(got.is_new);
        assert_eq!(got.resource, pkp(4));
    }

    #[tokio::test]
    async fn pkp_expiring_in_25_hours_is_reused() {
        let dir = TempDir::new().unwrap();
        seed_pkp(&dir, false, now() + TimeDelta::hours(25));

        let got = manager(&dir)
            .get_or_mint_pkp(|| async { Err::<PkpInfo, _>("must not mint") })
            .await
            .unwrap();
        assert!(!got.is_new);
        assert_eq!(got.resource, pkp(3));
    }

    #[tokio::test]
    async fn stale_legacy_pkp_is_not_migrated() {
        let dir = TempDir::new().unwrap();
        seed_pkp(&dir, true, now() + TimeDelta::hours(2));

        let mut mgr = manager(&dir);
        assert!(!mgr.existing_pkp().is_found());
        assert!(mgr.document().test_files["resources.rs"].pkps.is_empty());
    }

    #[tokio::test]
    async fn pkp_from_another_network_is_not_reused() {
        let dir = TempDir::new().unwrap();
        let mut doc = StateDocument::default();
        doc.test_file_mut("resources.rs").pkps.insert(
            "datil".into(),
            PkpRecord {
                info: pkp(5),
                created_at: now(),
                network: "datil-dev".into(),
                expires_at: None,
            },
        );
        StateStore::new(dir.path().join(".e2e-state.json"))
            .save(&doc)
            .unwrap();

        let got = manager(&dir)
            .get_or_mint_pkp(|| async { Ok::<_, String>(pkp(6)) })
            .await
            .unwrap();
        assert!(got.is_new);
        assert_eq!(got.resource, pkp(6));
    }

    #[tokio::test]
    async fn credits_expiring_in_23_hours_are_reminted() {
        let dir = TempDir::new().unwrap();
        seed_credits(&dir, now() + TimeDelta::hours(23));

        let mut mgr = manager(&dir);
        assert_eq!(mgr.existing_capacity_credits(), Lookup::NotFound);
        let got = mgr
            .get_or_mint_capacity_credits(|| async { Ok::<_, String>(credits(now(), 25)) })
            .await
            .unwrap();
        assert!(got.is_new);

        let stored = &mgr.document().test_files["resources.rs"].capacity_credits["datil"];
        assert_eq!(stored.expires_at, Utc.with_ymd_and_hms(2025, 4, 4, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn credits_expiring_in_25_hours_are_reused() {
        let dir = TempDir::new().unwrap();
        seed_credits(&dir, now() + TimeDelta::hours(25));

        let got = manager(&dir)
            .get_or_mint_capacity_credits(|| async { Err::<CapacityCreditInfo, _>("must not mint") })
            .await
            .unwrap();
        assert!(!got.is_new);
        assert_eq!(got.resource.capacity_token_id_str, "99");
    }

    #[tokio::test]
    async fn stale_legacy_credits_are_not_migrated() {
        let dir = TempDir::new().unwrap();
        let mut doc = StateDocument::default();
        doc.shared_capacity_credits.insert(
            "datil".into(),
            CapacityCreditRecord {
                info: credits(now(), 1),
                network: "datil".into(),
                expires_at: now() + TimeDelta::hours(2),
            },
        );
        StateStore::new(dir.path().join(".e2e-state.json"))
            .save(&doc)
            .unwrap();

        let mut mgr = manager(&dir);
        assert!(!mgr.existing_capacity_credits().is_found());
        assert!(mgr.document().test_files["resources.rs"].capacity_credits.is_empty());
    }
}
