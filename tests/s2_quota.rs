//! S2: quota enforcement (spec.md §8). A tenant at its manifest quota
//! gets the first push through and the second denied, regardless of which
//! account or repository within the tenant the pushes land in.

use chrono::Utc;
use keppel::error::Error;
use keppel::ident::Digest;
use keppel::ingest::{IngestEngine, PutManifestRequest, Reference};
use keppel::model::{Account, PolicySets, Quota, ReplicationStrategy};
use keppel::policy::validation::ProgramCache;
use keppel::storage::fs::FsStorageDriver;
use keppel::store::mem::MemStore;
use tokio_util::sync::CancellationToken;

fn account() -> Account {
    let now = Utc::now();
    Account {
        name: "acct".parse().unwrap(),
        auth_tenant_id: "tenant-t".to_string(),
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

fn schema2_body(config_digest: &str, layer_digest: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": keppel::manifest::media_types::DOCKER_MANIFEST_V2,
        "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "digest": config_digest, "size": 2},
        "layers": [{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": layer_digest, "size": 2}],
    }))
    .unwrap()
}

async fn mount_blob(store: &MemStore, acct: &Account, repo_id: i64, digest: &Digest) {
    store
        .insert_blob(
            keppel::model::Blob {
                id: 0,
                account_name: acct.name.clone(),
                digest: digest.clone(),
                size_bytes: 2,
                storage_id: digest.hex().to_string(),
                media_type: "application/octet-stream".to_string(),
                pushed_at: Utc::now(),
                validated_at: None,
                validation_error_message: None,
                can_be_deleted_at: None,
                blocks_vuln_scanning: keppel::model::VulnScanBlock::Unknown,
            },
            repo_id,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn second_manifest_past_quota_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemStore::new();
    let storage = FsStorageDriver::new(dir.path().to_path_buf());
    let acct = account();
    store.put_account(acct.clone()).await.unwrap();
    store.put_quota(Quota { auth_tenant_id: "tenant-t".to_string(), manifest_count_limit: 1 }).await.unwrap();
    let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();

    let cache = ProgramCache::new();
    let ingest = IngestEngine::new(&store, &storage, &cache);
    let cancel = CancellationToken::new();
    let now = Utc::now();

    let config_a = Digest::sha256(b"cfg-a");
    let layer_a = Digest::sha256(b"layer-a");
    mount_blob(&store, &acct, repo.id, &config_a).await;
    mount_blob(&store, &acct, repo.id, &layer_a).await;
    let body_a = schema2_body(&config_a.to_string(), &layer_a.to_string());
    let req_a = PutManifestRequest {
        account: &acct,
        repo_id: repo.id,
        repo_name: "library/nginx",
        reference: Reference::Tag("v1"),
        media_type: keppel::manifest::media_types::DOCKER_MANIFEST_V2,
        body: &body_a,
    };
    ingest.put_manifest(req_a, now, &cancel).await.unwrap();

    let config_b = Digest::sha256(b"cfg-b");
    let layer_b = Digest::sha256(b"layer-b");
    mount_blob(&store, &acct, repo.id, &config_b).await;
    mount_blob(&store, &acct, repo.id, &layer_b).await;
    let body_b = schema2_body(&config_b.to_string(), &layer_b.to_string());
    let req_b = PutManifestRequest {
        account: &acct,
        repo_id: repo.id,
        repo_name: "library/nginx",
        reference: Reference::Tag("v2"),
        media_type: keppel::manifest::media_types::DOCKER_MANIFEST_V2,
        body: &body_b,
    };
    let result = ingest.put_manifest(req_b, now, &cancel).await;
    match result {
        Err(Error::Denied(message)) => assert!(message.contains("quota")),
        other => panic!("expected Denied with a quota-exceeded message, got {other:?}"),
    }
}
