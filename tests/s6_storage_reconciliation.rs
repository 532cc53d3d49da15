//! S6: storage reconciliation (spec.md §8). An object storage holds but
//! the database has no row for is tombstoned with a grace period, then
//! deleted (and its tombstone cleared) once the grace period has passed.

use chrono::Utc;
use keppel::janitor::storage_sweep::StorageSweep;
use keppel::janitor::Sweep;
use keppel::model::{Account, PolicySets, ReplicationStrategy};
use keppel::storage::fs::FsStorageDriver;
use keppel::store::mem::MemStore;
use keppel::store::{AccountSweepKind, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn account() -> Account {
    let now = Utc::now();
    Account {
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
    }
}

#[tokio::test]
async fn orphan_object_is_tombstoned_then_deleted_after_its_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let storage: Arc<dyn keppel::storage::StorageDriver> = Arc::new(FsStorageDriver::new(dir.path().to_path_buf()));
    store.put_account(account()).await.unwrap();

    // Inject an orphan object directly into storage; the database never
    // heard about it.
    let cancel = CancellationToken::new();
    storage.append_to_blob("acct", "orphan-sid", 1, Some(5), b"hello", &cancel).await.unwrap();
    storage.finalize_blob("acct", "orphan-sid", 1, &cancel).await.unwrap();

    // First run, with a grace period that has not elapsed yet: the
    // object is discovered and an UnknownBlob tombstone is recorded with
    // can_be_deleted_at = now + grace, but nothing is deleted.
    let sweep = StorageSweep::new(store.clone(), storage.clone(), Duration::from_secs(60), Duration::from_secs(3600));
    let outcome = sweep.run_once().await.unwrap();
    assert_eq!(outcome.processed, 1);
    assert!(store.due_unknown_blobs("acct", Utc::now(), 10).await.unwrap().is_empty());
    let far_future = Utc::now() + chrono::Duration::hours(2);
    let tombstoned = store.due_unknown_blobs("acct", far_future, 10).await.unwrap();
    assert_eq!(tombstoned.len(), 1);
    assert_eq!(tombstoned[0].storage_id, "orphan-sid");

    // Re-run with no grace period, once the account is due again: the
    // sweep re-records the same tombstone and then, on this same pass,
    // finds it already due and clears both the storage object and the
    // UnknownBlob row.
    store.reschedule_account("acct", AccountSweepKind::StorageSweep, Utc::now()).await.unwrap();
    let sweep = StorageSweep::new(store.clone(), storage.clone(), Duration::from_secs(60), Duration::from_secs(0));
    let outcome = sweep.run_once().await.unwrap();
    assert_eq!(outcome.processed, 1);
    assert!(store.due_unknown_blobs("acct", Utc::now(), 10).await.unwrap().is_empty());
}
