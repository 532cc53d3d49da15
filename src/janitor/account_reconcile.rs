//! Account-reconcile sweep (spec.md §4.8): diff the managed-account
//! driver's inventory against account rows and apply drift. Unlike the
//! other sweeps, this one does not pick from a `next_…_at` schedule —
//! the driver's own inventory is the work list, since a managed account
//! may not have a row yet.

use super::{Sweep, SweepOutcome};
use crate::error::Result;
use crate::managed_account::ManagedAccountDriver;
use crate::model::Account;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct AccountReconcile {
    store: Arc<dyn Store>,
    driver: Arc<dyn ManagedAccountDriver>,
    deletion_grace: chrono::Duration,
}

impl AccountReconcile {
    pub fn new(store: Arc<dyn Store>, driver: Arc<dyn ManagedAccountDriver>, deletion_grace: Duration) -> Self {
        Self {
            store,
            driver,
            deletion_grace: chrono::Duration::from_std(deletion_grace).unwrap_or(chrono::Duration::hours(6)),
        }
    }
}

#[async_trait]
impl Sweep for AccountReconcile {
    fn name(&self) -> &'static str {
        "account_reconcile"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let managed = self.driver.managed_accounts().await?;
        let mut processed = 0u32;

        for name in &managed {
            let desired = self.driver.desired_state(name).await?;
            let existing = self.store.get_account(name).await?;
            match (desired, existing) {
                (Some(desired), Some(mut account)) => {
                    account.auth_tenant_id = desired.auth_tenant_id;
                    account.replication = desired.replication;
                    account.platform_filter = desired.platform_filter;
                    account.validation_rule = desired.validation_rule;
                    account.policies = desired.policies;
                    account.metadata = desired.metadata;
                    account.is_deleting = false;
                    self.store.put_account(account).await?;
                    processed += 1;
                }
                (Some(desired), None) => {
                    self.store
                        .put_account(Account {
                            name: name.parse()?,
                            auth_tenant_id: desired.auth_tenant_id,
                            replication: desired.replication,
                            platform_filter: desired.platform_filter,
                            validation_rule: desired.validation_rule,
                            policies: desired.policies,
                            metadata: desired.metadata,
                            next_blob_sweep_at: now,
                            next_storage_sweep_at: now,
                            next_federation_announce_at: now,
                            is_deleting: false,
                        })
                        .await?;
                    info!(account = name.as_str(), "created account from managed-account driver state");
                    processed += 1;
                }
                (None, Some(mut account)) if !account.is_deleting => {
                    account.is_deleting = true;
                    self.store.put_account(account).await?;
                    info!(account = name.as_str(), "marked account for staged deletion");
                    processed += 1;
                }
                (None, Some(account)) => {
                    if !self.store.account_has_blobs(account.name.as_str()).await? {
                        self.store.delete_account(name).await?;
                        info!(account = name.as_str(), "deleted fully-drained account");
                        processed += 1;
                    }
                }
                (None, None) => {}
            }
        }

        Ok(SweepOutcome { processed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed_account::DesiredAccountState;
    use crate::model::{PolicySets, ReplicationStrategy};
    use crate::store::mem::MemStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct OneShotDriver {
        state: Mutex<Option<DesiredAccountState>>,
    }

    #[async_trait]
    impl ManagedAccountDriver for OneShotDriver {
        async fn managed_accounts(&self) -> Result<Vec<String>> {
            Ok(vec!["managed".to_string()])
        }

        async fn desired_state(&self, _account: &str) -> Result<Option<DesiredAccountState>> {
            Ok(self.state.lock().unwrap().clone())
        }
    }

    impl Clone for DesiredAccountState {
        fn clone(&self) -> Self {
            DesiredAccountState {
                auth_tenant_id: self.auth_tenant_id.clone(),
                replication: match &self.replication {
                    ReplicationStrategy::None => ReplicationStrategy::None,
                    ReplicationStrategy::OnFirstUse { upstream_peer_hostname } => {
                        ReplicationStrategy::OnFirstUse { upstream_peer_hostname: upstream_peer_hostname.clone() }
                    }
                    ReplicationStrategy::FromExternalOnFirstUse { url, username, password } => {
                        ReplicationStrategy::FromExternalOnFirstUse {
                            url: url.clone(),
                            username: username.clone(),
                            password: password.clone(),
                        }
                    }
                },
                platform_filter: self.platform_filter.clone(),
                validation_rule: self.validation_rule.clone(),
                policies: self.policies.clone(),
                metadata: self.metadata.clone(),
            }
        }
    }

    #[tokio::test]
    async fn creates_a_new_account_from_driver_state() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let driver = Arc::new(OneShotDriver {
            state: Mutex::new(Some(DesiredAccountState {
                auth_tenant_id: "tenant-a".to_string(),
                replication: ReplicationStrategy::None,
                platform_filter: vec![],
                validation_rule: None,
                policies: PolicySets::default(),
                metadata: Default::default(),
            })),
        });

        let sweep = AccountReconcile::new(store.clone(), driver.clone(), Duration::from_secs(6 * 3600));
        let outcome = sweep.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(store.get_account("managed").await.unwrap().is_some());

        *driver.state.lock().unwrap() = None;
        let outcome = sweep.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(store.get_account("managed").await.unwrap().unwrap().is_deleting);
    }
}
