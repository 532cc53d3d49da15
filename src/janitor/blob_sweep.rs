//! Blob sweep (spec.md §4.8: "mark blobs not referenced by any mount
//! and not pending; on second observation ... delete DB row and
//! storage object").

use super::{Sweep, SweepOutcome};
use crate::error::Result;
use crate::storage::StorageDriver;
use crate::store::{AccountSweepKind, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct BlobSweep {
    store: Arc<dyn Store>,
    storage: Arc<dyn StorageDriver>,
    reschedule_interval: chrono::Duration,
    grace_period: chrono::Duration,
    batch_size: u32,
}

impl BlobSweep {
    pub fn new(store: Arc<dyn Store>, storage: Arc<dyn StorageDriver>, reschedule_interval: Duration, grace_period: Duration) -> Self {
        Self {
            store,
            storage,
            reschedule_interval: chrono::Duration::from_std(reschedule_interval).unwrap_or(chrono::Duration::seconds(30)),
            grace_period: chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::hours(6)),
            batch_size: 50,
        }
    }
}

#[async_trait]
impl Sweep for BlobSweep {
    fn name(&self) -> &'static str {
        "blob_sweep"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let due = self.store.due_accounts_for(AccountSweepKind::BlobSweep, now, 1).await?;
        let Some(account) = due.into_iter().next() else {
            return Ok(SweepOutcome::NOTHING_DUE);
        };

        let cancel = CancellationToken::new();
        for blob in self.store.unreferenced_blobs(account.name.as_str(), self.batch_size).await? {
            match blob.can_be_deleted_at {
                None => {
                    debug!(account = account.name.as_str(), digest = %blob.digest, "tombstoning unreferenced blob");
                    self.store.mark_blob_deletable(blob.id, now + self.grace_period).await?;
                }
                Some(at) if at <= now => {
                    self.storage.delete_blob(account.name.as_str(), &blob.storage_id, &cancel).await?;
                    self.store.delete_blob(blob.id).await?;
                    info!(account = account.name.as_str(), digest = %blob.digest, "deleted unreferenced blob");
                }
                Some(_) => {}
            }
        }

        self.store
            .reschedule_account(account.name.as_str(), AccountSweepKind::BlobSweep, now + self.reschedule_interval)
            .await?;
        Ok(SweepOutcome::one())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, Blob, BlobMount, PolicySets, ReplicationStrategy, VulnScanBlock};
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
    async fn tombstones_an_unmounted_blob_then_deletes_it_on_second_pass() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let storage: Arc<dyn StorageDriver> = Arc::new(FsStorageDriver::new(dir.path().to_path_buf()));
        let acct = account("acct");
        store.put_account(acct.clone()).await.unwrap();
        let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();

        let digest = crate::ident::Digest::sha256(b"hello");
        let blob = Blob {
            id: 0,
            account_name: acct.name.clone(),
            digest: digest.clone(),
            size_bytes: 5,
            storage_id: "abc".to_string(),
            media_type: "application/octet-stream".to_string(),
            pushed_at: Utc::now(),
            validated_at: None,
            validation_error_message: None,
            can_be_deleted_at: None,
            blocks_vuln_scanning: VulnScanBlock::Unknown,
        };
        store.insert_blob(blob, repo.id).await.unwrap();
        let mounted = store.get_blob("acct", &digest.to_string()).await.unwrap().unwrap();
        store.delete_blob_mount(mounted.id, repo.id).await.ok();
        // MemStore's insert_blob mounts the blob in `repo.id`; remove that
        // mount explicitly so the sweep sees it as unreferenced.
        let _ = BlobMount { blob_id: mounted.id, repo_id: repo.id, can_be_deleted_at: None };

        let sweep = BlobSweep::new(store.clone(), storage, Duration::from_secs(30), Duration::from_secs(0));
        let outcome = sweep.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);

        let blob = store.get_blob("acct", &digest.to_string()).await.unwrap().unwrap();
        assert!(blob.can_be_deleted_at.is_some());

        // Second pass: grace period is zero, so it is now due for deletion.
        store
            .reschedule_account("acct", AccountSweepKind::BlobSweep, Utc::now())
            .await
            .unwrap();
        let outcome = sweep.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(store.get_blob("acct", &digest.to_string()).await.unwrap().is_none());
    }
}
