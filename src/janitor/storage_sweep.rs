//! Storage-reconciliation sweep (spec.md §4.8 storage sweep): list what
//! a storage backend actually holds for a due account, and tombstone
//! then delete anything storage has that the database does not know
//! about. Never trusts absence from the listing as proof of anything
//! (spec.md §4.3 `ListStorageContents`) — it only acts on objects the
//! listing positively reports.

use super::{Sweep, SweepOutcome};
use crate::error::Result;
use crate::model::{UnknownBlob, UnknownManifest};
use crate::storage::StorageDriver;
use crate::store::{AccountSweepKind, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct StorageSweep {
    store: Arc<dyn Store>,
    storage: Arc<dyn StorageDriver>,
    reschedule_interval: chrono::Duration,
    grace_period: chrono::Duration,
    batch_size: u32,
}

impl StorageSweep {
    pub fn new(store: Arc<dyn Store>, storage: Arc<dyn StorageDriver>, reschedule_interval: Duration, grace_period: Duration) -> Self {
        Self {
            store,
            storage,
            reschedule_interval: chrono::Duration::from_std(reschedule_interval).unwrap_or(chrono::Duration::hours(1)),
            grace_period: chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::hours(6)),
            batch_size: 50,
        }
    }

    async fn is_manifest_known(&self, account: &str, key: &crate::storage::StoredManifestKey) -> Result<bool> {
        let Some(repo) = self.store.get_repository(account, &key.repo_name).await? else {
            return Ok(false);
        };
        Ok(self.store.get_manifest(repo.id, &key.digest).await?.is_some())
    }
}

#[async_trait]
impl Sweep for StorageSweep {
    fn name(&self) -> &'static str {
        "storage_sweep"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let due = self.store.due_accounts_for(AccountSweepKind::StorageSweep, now, 1).await?;
        let Some(account) = due.into_iter().next() else {
            return Ok(SweepOutcome::NOTHING_DUE);
        };
        let cancel = CancellationToken::new();
        let contents = self.storage.list_storage_contents(account.name.as_str(), &cancel).await?;

        for storage_id in &contents.blob_storage_ids {
            if !self.store.blob_exists_by_storage_id(account.name.as_str(), storage_id).await? {
                debug!(account = account.name.as_str(), storage_id = storage_id.as_str(), "tombstoning unknown blob in storage");
                self.store
                    .record_unknown_blob(UnknownBlob {
                        account_name: account.name.clone(),
                        storage_id: storage_id.clone(),
                        can_be_deleted_at: now + self.grace_period,
                    })
                    .await?;
            }
        }
        for key in &contents.manifests {
            if !self.is_manifest_known(account.name.as_str(), key).await? {
                debug!(account = account.name.as_str(), repo = key.repo_name.as_str(), digest = key.digest.as_str(), "tombstoning unknown manifest in storage");
                self.store
                    .record_unknown_manifest(UnknownManifest {
                        account_name: account.name.clone(),
                        repo_name: key.repo_name.clone(),
                        digest: key.digest.parse()?,
                        can_be_deleted_at: now + self.grace_period,
                    })
                    .await?;
            }
        }

        for unknown in self.store.due_unknown_blobs(account.name.as_str(), now, self.batch_size).await? {
            self.storage.delete_blob(account.name.as_str(), &unknown.storage_id, &cancel).await?;
            self.store.clear_unknown_blob(account.name.as_str(), &unknown.storage_id).await?;
            info!(account = account.name.as_str(), storage_id = unknown.storage_id.as_str(), "deleted unknown blob from storage");
        }
        for unknown in self.store.due_unknown_manifests(account.name.as_str(), now, self.batch_size).await? {
            let digest = unknown.digest.to_string();
            self.storage
                .delete_manifest(account.name.as_str(), &unknown.repo_name, &digest, &cancel)
                .await?;
            self.store.clear_unknown_manifest(account.name.as_str(), &unknown.repo_name, &digest).await?;
            info!(account = account.name.as_str(), repo = unknown.repo_name.as_str(), digest = digest.as_str(), "deleted unknown manifest from storage");
        }

        self.store
            .reschedule_account(account.name.as_str(), AccountSweepKind::StorageSweep, now + self.reschedule_interval)
            .await?;
        Ok(SweepOutcome::one())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, PolicySets, ReplicationStrategy};
    use crate::storage::fs::FsStorageDriver;
    use crate::store::mem::MemStore;

    fn account(name: &str) -> Account {
        let now = Utc::now();
        Account {
            name: name.parse().unwrap(),
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
        }
    }

    #[tokio::test]
    async fn tombstones_a_storage_object_with_no_db_row_then_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let storage: Arc<dyn StorageDriver> = Arc::new(FsStorageDriver::new(dir.path().to_path_buf()));
        store.put_account(account("acct")).await.unwrap();

        let cancel = CancellationToken::new();
        storage.append_to_blob("acct", "orphan", 1, Some(3), b"hey", &cancel).await.unwrap();
        storage.finalize_blob("acct", "orphan", 1, &cancel).await.unwrap();

        let sweep = StorageSweep::new(store.clone(), storage.clone(), Duration::from_secs(3600), Duration::from_secs(0));
        let outcome = sweep.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);

        store.reschedule_account("acct", AccountSweepKind::StorageSweep, Utc::now()).await.unwrap();
        let outcome = sweep.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(store.due_unknown_blobs("acct", Utc::now(), 10).await.unwrap().is_empty());
    }
}
