//! Manifest sync sweep (spec.md §4.8, replica accounts only): diff a
//! due repository's upstream tag list against local tags and pull
//! through anything missing, reusing the same ingest pipeline a client
//! push would go through.

use super::{Sweep, SweepOutcome};
use crate::error::Result;
use crate::ingest::{IngestEngine, PutManifestRequest, Reference};
use crate::model::ReplicationStrategy;
use crate::policy::validation::ProgramCache;
use crate::replication::ReplicationEngine;
use crate::storage::StorageDriver;
use crate::store::{RepoSweepKind, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ManifestSync {
    store: Arc<dyn Store>,
    storage: Arc<dyn StorageDriver>,
    reschedule_interval: chrono::Duration,
}

impl ManifestSync {
    pub fn new(store: Arc<dyn Store>, storage: Arc<dyn StorageDriver>, reschedule_interval: Duration) -> Self {
        Self {
            store,
            storage,
            reschedule_interval: chrono::Duration::from_std(reschedule_interval).unwrap_or(chrono::Duration::minutes(30)),
        }
    }
}

#[async_trait]
impl Sweep for ManifestSync {
    fn name(&self) -> &'static str {
        "manifest_sync"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let due = self.store.due_repositories_for(RepoSweepKind::ManifestSync, now, 1).await?;
        let Some(repo) = due.into_iter().next() else {
            return Ok(SweepOutcome::NOTHING_DUE);
        };
        let Some(account) = self.store.get_account(repo.account_name.as_str()).await? else {
            return Ok(SweepOutcome::NOTHING_DUE);
        };

        if matches!(account.replication, ReplicationStrategy::None) {
            self.store
                .reschedule_repository(repo.id, RepoSweepKind::ManifestSync, now + self.reschedule_interval)
                .await?;
            return Ok(SweepOutcome::one());
        }

        let replication = ReplicationEngine::new(self.store.as_ref(), self.storage.as_ref());
        let upstream_tags = replication.list_upstream_tags(&account, repo.name.as_str()).await?;
        let local_tags = self.store.list_tags(repo.id).await?;
        let cancel = CancellationToken::new();
        let validation_cache = ProgramCache::new();

        for tag_name in &upstream_tags {
            let (media_type, body) = replication.fetch_manifest(&account, repo.name.as_str(), tag_name).await?;
            let digest = crate::ident::Digest::sha256(&body);
            let already_current = local_tags.iter().any(|t| &t.name == tag_name && t.digest.to_string() == digest.to_string());
            if already_current {
                continue;
            }

            let ingest = IngestEngine::new(self.store.as_ref(), self.storage.as_ref(), &validation_cache)
                .with_replication(&replication);
            ingest
                .put_manifest(
                    PutManifestRequest {
                        account: &account,
                        repo_id: repo.id,
                        repo_name: repo.name.as_str(),
                        reference: Reference::Tag(tag_name),
                        media_type: &media_type,
                        body: &body,
                    },
                    now,
                    &cancel,
                )
                .await?;
            info!(account = repo.account_name.as_str(), repo = repo.name.as_str(), tag = tag_name.as_str(), "synced tag from upstream");
        }

        // Remove any local tag upstream no longer carries (spec.md §4.8:
        // "remove tags deleted upstream").
        for tag in &local_tags {
            if !upstream_tags.contains(&tag.name) {
                self.store.delete_tag(repo.id, &tag.name).await?;
                info!(account = repo.account_name.as_str(), repo = repo.name.as_str(), tag = tag.name.as_str(), "removed tag deleted upstream");
            }
        }

        self.store
            .reschedule_repository(repo.id, RepoSweepKind::ManifestSync, now + self.reschedule_interval)
            .await?;
        Ok(SweepOutcome::one())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, Manifest, ManifestContent, PolicySets, Tag, TrivySecurityInfo};
    use crate::storage::fs::FsStorageDriver;
    use crate::store::mem::MemStore;
    use crate::store::ManifestIngest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A minimal HTTP/1.1 upstream that always answers `GET .../tags/list`
    /// with `body`, standing in for a peer/external registry without a
    /// mocking crate (none is grounded anywhere in the retrieval pack).
    async fn spawn_tags_list_upstream(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn removes_a_local_tag_no_longer_present_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let storage: Arc<dyn StorageDriver> = Arc::new(FsStorageDriver::new(dir.path().to_path_buf()));
        let url = spawn_tags_list_upstream(r#"{"tags":[]}"#).await;
        let now = Utc::now();
        store
            .put_account(Account {
                name: "acct".parse().unwrap(),
                auth_tenant_id: "tenant-a".to_string(),
                replication: ReplicationStrategy::FromExternalOnFirstUse { url, username: "anon".to_string(), password: None },
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
        let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();

        let digest = crate::ident::Digest::sha256(b"stale-manifest-body");
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
        let tag = Tag { repo_id: repo.id, name: "stale".to_string(), digest: digest.clone(), pushed_at: now, last_pulled_at: None };
        store
            .commit_manifest_ingest(ManifestIngest {
                manifest,
                content: ManifestContent { repo_id: repo.id, digest: digest.clone(), content: b"stale-manifest-body".to_vec() },
                blob_refs: vec![],
                manifest_refs: vec![],
                tag_upsert: Some(tag),
                trivy_info: TrivySecurityInfo::queued(repo.id, digest.to_string(), now),
            })
            .await
            .unwrap();

        let sync = ManifestSync::new(store.clone(), storage, Duration::from_secs(1800));
        let outcome = sync.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(store.get_tag(repo.id, "stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_a_repo_whose_account_has_no_replication_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let storage: Arc<dyn StorageDriver> = Arc::new(FsStorageDriver::new(dir.path().to_path_buf()));
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
        store.get_or_create_repository("acct", "library/nginx").await.unwrap();

        let sync = ManifestSync::new(store.clone(), storage, Duration::from_secs(1800));
        let outcome = sync.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(sync.run_once().await.unwrap(), SweepOutcome::NOTHING_DUE);
    }
}
