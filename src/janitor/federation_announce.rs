//! Federation announce sweep (spec.md §4.8): periodically reassert
//! ownership of a due account with the federation driver.

use super::{Sweep, SweepOutcome};
use crate::error::Result;
use crate::federation::FederationDriver;
use crate::store::{AccountSweepKind, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct FederationAnnounce {
    store: Arc<dyn Store>,
    federation: Arc<dyn FederationDriver>,
    reschedule_interval: chrono::Duration,
}

impl FederationAnnounce {
    pub fn new(store: Arc<dyn Store>, federation: Arc<dyn FederationDriver>, reschedule_interval: Duration) -> Self {
        Self {
            store,
            federation,
            reschedule_interval: chrono::Duration::from_std(reschedule_interval).unwrap_or(chrono::Duration::minutes(10)),
        }
    }
}

#[async_trait]
impl Sweep for FederationAnnounce {
    fn name(&self) -> &'static str {
        "federation_announce"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let due = self.store.due_accounts_for(AccountSweepKind::FederationAnnounce, now, 1).await?;
        let Some(account) = due.into_iter().next() else {
            return Ok(SweepOutcome::NOTHING_DUE);
        };

        self.federation.announce(account.name.as_str()).await?;
        debug!(account = account.name.as_str(), "announced account ownership to federation driver");
        self.store
            .reschedule_account(account.name.as_str(), AccountSweepKind::FederationAnnounce, now + self.reschedule_interval)
            .await?;
        Ok(SweepOutcome::one())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::NoopFederation;
    use crate::model::{Account, PolicySets, ReplicationStrategy};
    use crate::store::mem::MemStore;

    #[tokio::test]
    async fn announces_a_due_account_then_reschedules_it() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let now = Utc::now();
        store
            .put_account(Account {
                name: "acct".parse().unwrap(),
                auth_tenant_id: "tenant-a".to_string(),
                replication: ReplicationStrategy::None,
                platform_filter: vec![],
                validation_rule: None,
                policies: PolicySets::default(),
                metadata: Default::default(),
                next_blob_sweep_at: now,
                next_storage_sweep_at: now,
                next_federation_announce_at: now,
                is_deleting: false,
            })
            .await
            .unwrap();

        let sweep = FederationAnnounce::new(store.clone(), Arc::new(NoopFederation), Duration::from_secs(600));
        let outcome = sweep.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(sweep.run_once().await.unwrap(), SweepOutcome::NOTHING_DUE);
    }
}
