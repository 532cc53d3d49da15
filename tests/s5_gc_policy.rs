//! S5: GC policy (spec.md §8). A `delete_if_untagged` policy matching
//! `^pr-.*` tags removes a manifest once its matching tag is gone, and
//! the manifest becomes unknown to a subsequent lookup.

use chrono::Utc;
use keppel::ident::Digest;
use keppel::janitor::manifest_gc::ManifestGc;
use keppel::janitor::Sweep;
use keppel::model::{Account, Manifest, ManifestContent, PolicySets, ReplicationStrategy, Tag, TrivySecurityInfo};
use keppel::policy::gc::{GcAction, GcPolicy};
use keppel::policy::MatchRule;
use keppel::storage::fs::FsStorageDriver;
use keppel::store::mem::MemStore;
use keppel::store::{ManifestIngest, Store};
use std::sync::Arc;
use std::time::Duration;

fn account_with_pr_gc_policy() -> Account {
    let now = Utc::now();
    let mut policies = PolicySets::default();
    policies.gc_policies.push(GcPolicy {
        rule: MatchRule {
            repository: ".*".to_string(),
            negative_repository: None,
            tag: Some("^pr-.*".to_string()),
            negative_tag: None,
        },
        action: GcAction::DeleteIfUntagged,
    });
    Account {
        name: "acct".parse().unwrap(),
        auth_tenant_id: "tenant-a".to_string(),
        replication: ReplicationStrategy::None,
        platform_filter: vec![],
        validation_rule: None,
        policies,
        metadata: Default::default(),
        next_blob_sweep_at: now,
        next_storage_sweep_at: now,
        next_federation_announce_at: now,
        is_deleting: false,
    }
}

#[tokio::test]
async fn untagged_pr_manifest_is_deleted_by_the_gc_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let storage: Arc<dyn keppel::storage::StorageDriver> = Arc::new(FsStorageDriver::new(dir.path().to_path_buf()));
    store.put_account(account_with_pr_gc_policy()).await.unwrap();
    let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();

    let digest = Digest::sha256(b"pr-42-manifest-body");
    let now = Utc::now();
    let manifest = Manifest {
        repo_id: repo.id,
        digest: digest.clone(),
        media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
        size_bytes: 20,
        pushed_at: now,
        validated_at: None,
        validation_error_message: None,
        last_pulled_at: None,
        min_layer_created_at: None,
        max_layer_created_at: None,
        labels: Default::default(),
        gc_status: Default::default(),
    };
    let tag = Tag { repo_id: repo.id, name: "pr-42".to_string(), digest: digest.clone(), pushed_at: now, last_pulled_at: None };
    store
        .commit_manifest_ingest(ManifestIngest {
            manifest,
            content: ManifestContent { repo_id: repo.id, digest: digest.clone(), content: b"pr-42-manifest-body".to_vec() },
            blob_refs: vec![],
            manifest_refs: vec![],
            tag_upsert: Some(tag),
            trivy_info: TrivySecurityInfo::queued(repo.id, digest.to_string(), now),
        })
        .await
        .unwrap();

    // Untag it: pr-42 no longer points anywhere.
    store.delete_tag(repo.id, "pr-42").await.unwrap();

    let gc = ManifestGc::new(store.clone(), storage, Duration::from_secs(60));
    let outcome = gc.run_once().await.unwrap();
    assert_eq!(outcome.processed, 1);

    assert!(store.get_manifest(repo.id, &digest.to_string()).await.unwrap().is_none());
}
