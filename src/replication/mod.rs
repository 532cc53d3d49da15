//! Replication engine (spec.md §4.7)
//!
//! Implements the on-first-use pull-through path for replica accounts:
//! the `pending_blobs` coordination protocol that guarantees at-most-one
//! concurrent replication of any (account, digest), peer/external
//! upstream selection, and upstream-error translation. Outbound HTTP is
//! grounded on `rune::image::registry::Registry`'s `pull_manifest`/
//! `pull_blob`/`push_blob` shape over `reqwest`, generalized here to the
//! peer-vs-external-upstream distinction and the pending-lock protocol
//! the teacher's client does not need.

pub mod cache;

use crate::error::{Error, Result};
use crate::ident::Digest;
use crate::manifest::ParsedManifest;
use crate::model::{Account, Blob, BlobMount, PendingBlob, PendingBlobReason, ReplicationStrategy, VulnScanBlock};
use crate::storage::StorageDriver;
use crate::store::Store;
use cache::InboundCache;
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Operator-facing knobs for the pending-lock wait (spec.md §9 Open
/// Questions: "pending-blob timeout and maximum retry count are not
/// fixed by the source"). Resolved in DESIGN.md.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// How long a single worker may hold the pending lock before a
    /// competing caller considers it abandoned and retries acquisition.
    pub pending_blob_timeout: Duration,
    /// Interval between polls while waiting on someone else's lock.
    pub poll_interval: Duration,
    /// Bounded retry count for the whole acquire-or-wait loop (spec.md
    /// §4.7 step 2: "retry from step 1, bounded N attempts").
    pub max_retries: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            pending_blob_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            max_retries: 20,
        }
    }
}

pub struct ReplicationEngine<'a> {
    store: &'a dyn Store,
    storage: &'a dyn StorageDriver,
    http: reqwest::Client,
    cache: Option<&'a dyn InboundCache>,
    config: ReplicationConfig,
}

impl<'a> ReplicationEngine<'a> {
    pub fn new(store: &'a dyn Store, storage: &'a dyn StorageDriver) -> Self {
        Self { store, storage, http: reqwest::Client::new(), cache: None, config: ReplicationConfig::default() }
    }

    pub fn with_cache(mut self, cache: &'a dyn InboundCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Ensure `digest` is mounted in `repo_id` for `account`, pulling it
    /// through from the account's upstream if necessary (spec.md §4.7
    /// steps 1-5). Returns the local blob row either way.
    pub async fn ensure_blob_mounted(
        &self,
        account: &Account,
        repo_id: i64,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Blob> {
        for _attempt in 0..self.config.max_retries {
            if let Some(blob) = self.store.get_blob(account.name.as_str(), &digest.to_string()).await? {
                self.store
                    .insert_blob_mount(BlobMount { blob_id: blob.id, repo_id, can_be_deleted_at: None })
                    .await?;
                return Ok(blob);
            }

            let pending = PendingBlob {
                account_name: account.name.clone(),
                digest: digest.clone(),
                reason: PendingBlobReason::Replication,
                since: Utc::now(),
            };
            if self.store.try_acquire_pending_blob(pending).await? {
                return self.pull_and_commit(account, repo_id, digest, cancel).await;
            }

            if !self.wait_for_other_worker(account, digest, cancel).await? {
                continue;
            }
            if let Some(blob) = self.store.get_blob(account.name.as_str(), &digest.to_string()).await? {
                self.store
                    .insert_blob_mount(BlobMount { blob_id: blob.id, repo_id, can_be_deleted_at: None })
                    .await?;
                return Ok(blob);
            }
        }
        warn!(account = account.name.as_str(), digest = %digest, attempts = self.config.max_retries, "replication timed out");
        Err(Error::Upstream(format!("replication of {digest} timed out after {} attempts", self.config.max_retries)))
    }

    /// Poll until the other worker's pending row either disappears
    /// (lost the race or timed out: `false`, caller retries acquisition)
    /// or the blob shows up (`true`).
    async fn wait_for_other_worker(
        &self,
        account: &Account,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.config.pending_blob_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Upstream("replication wait cancelled".to_string()));
            }
            if self.store.get_blob(account.name.as_str(), &digest.to_string()).await?.is_some() {
                return Ok(true);
            }
            if self.store.get_pending_blob(account.name.as_str(), &digest.to_string()).await?.is_none() {
                return Ok(false);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Upstream("replication wait cancelled".to_string()));
                }
            }
        }
    }

    /// Steps 3-5: select the upstream, stream the blob through a fresh
    /// storage upload, and commit it. On any failure the storage upload
    /// and the pending row are both cleaned up so a retry is possible.
    async fn pull_and_commit(
        &self,
        account: &Account,
        repo_id: i64,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Blob> {
        match self.pull_and_commit_inner(account, repo_id, digest, cancel).await {
            Ok(blob) => Ok(blob),
            Err(err) => {
                let _ = self.store.delete_pending_blob(account.name.as_str(), &digest.to_string()).await;
                Err(err)
            }
        }
    }

    async fn pull_and_commit_inner(
        &self,
        account: &Account,
        repo_id: i64,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Blob> {
        let upstream = Upstream::select(self.store, account).await?;
        let bytes = upstream.fetch_blob(&self.http, digest).await?;

        let storage_id = crate::storage::new_storage_id();
        let account_str = account.name.as_str();
        let appended = self
            .storage
            .append_to_blob(account_str, &storage_id, 1, Some(bytes.len() as u64), &bytes, cancel)
            .await?;

        if appended.digest_hex != digest.hex() {
            self.storage.abort_blob_upload(account_str, &storage_id, 1, cancel).await?;
            return Err(Error::DigestInvalid(format!(
                "upstream blob {digest} does not hash to its advertised digest"
            )));
        }
        self.storage.finalize_blob(account_str, &storage_id, 1, cancel).await?;

        let blob = Blob {
            id: 0,
            account_name: account.name.clone(),
            digest: digest.clone(),
            size_bytes: bytes.len() as i64,
            storage_id,
            media_type: "application/octet-stream".to_string(),
            pushed_at: Utc::now(),
            validated_at: None,
            validation_error_message: None,
            can_be_deleted_at: None,
            blocks_vuln_scanning: VulnScanBlock::Unknown,
        };
        self.store.insert_blob(blob.clone(), repo_id).await?;
        self.store.delete_pending_blob(account_str, &digest.to_string()).await?;
        info!(account = account_str, digest = %digest, "replicated blob from upstream");

        Ok(self.store.get_blob(account_str, &digest.to_string()).await?.unwrap_or(blob))
    }

    /// Pull-through for manifests, consulting the inbound cache first
    /// (spec.md §4.7: "Cache misses always fall through; cache storage
    /// errors are non-fatal").
    pub async fn fetch_manifest(
        &self,
        account: &Account,
        repo_name: &str,
        reference: &str,
    ) -> Result<(String, Vec<u8>)> {
        let upstream = Upstream::select(self.store, account).await?;
        let key = cache::CacheKey {
            host: upstream.host(),
            repo_name: repo_name.to_string(),
            reference: reference.to_string(),
        };
        if let Some(cache) = self.cache {
            if let Some(hit) = cache.get(&key).await {
                return Ok(hit);
            }
        }
        let (media_type, body) = upstream.fetch_manifest(&self.http, repo_name, reference).await?;
        if let Some(cache) = self.cache {
            cache.put(key, media_type.clone(), body.clone()).await;
        }
        Ok((media_type, body))
    }

    /// List every tag the upstream currently has for `repo_name`
    /// (spec.md §4.8 manifest sync: "diff the upstream's tag list
    /// against local tags"). Bypasses the inbound cache; tag lists are
    /// not cached entries.
    pub async fn list_upstream_tags(&self, account: &Account, repo_name: &str) -> Result<Vec<String>> {
        let upstream = Upstream::select(self.store, account).await?;
        upstream.list_tags(&self.http, repo_name).await
    }
}

/// Resolved upstream for one replica account (spec.md §4.7 step 3).
enum Upstream {
    Peer { hostname: String, password: String },
    External { url: String, username: String, password: Option<String> },
}

impl Upstream {
    async fn select(store: &dyn Store, account: &Account) -> Result<Self> {
        match &account.replication {
            ReplicationStrategy::OnFirstUse { upstream_peer_hostname } => {
                let peer = store
                    .get_peer(upstream_peer_hostname)
                    .await?
                    .ok_or_else(|| Error::NameUnknown(format!("peer {upstream_peer_hostname:?} is not known")))?;
                Ok(Upstream::Peer { hostname: peer.hostname, password: peer.our_password })
            }
            ReplicationStrategy::FromExternalOnFirstUse { url, username, password } => {
                Ok(Upstream::External { url: url.clone(), username: username.clone(), password: password.clone() })
            }
            ReplicationStrategy::None => {
                Err(Error::Unsupported("account has no replication configuration".to_string()))
            }
        }
    }

    fn host(&self) -> String {
        match self {
            Upstream::Peer { hostname, .. } => hostname.clone(),
            Upstream::External { url, .. } => url.clone(),
        }
    }

    fn base_url(&self) -> String {
        match self {
            Upstream::Peer { hostname, .. } => format!("https://{hostname}"),
            Upstream::External { url, .. } => url.clone(),
        }
    }

    fn basic_auth(&self) -> (String, Option<String>) {
        match self {
            Upstream::Peer { hostname, password } => (hostname.clone(), Some(password.clone())),
            Upstream::External { username, password, .. } => (username.clone(), password.clone()),
        }
    }

    async fn fetch_blob(&self, http: &reqwest::Client, digest: &Digest) -> Result<Vec<u8>> {
        let (user, pass) = self.basic_auth();
        let response = http
            .get(format!("{}/v2/_replication/blobs/{digest}", self.base_url()))
            .basic_auth(user, pass)
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!("upstream returned {} for blob {digest}", response.status())));
        }
        response.bytes().await.map(|b| b.to_vec()).map_err(|e| Error::Upstream(e.to_string()))
    }

    async fn fetch_manifest(
        &self,
        http: &reqwest::Client,
        repo_name: &str,
        reference: &str,
    ) -> Result<(String, Vec<u8>)> {
        let (user, pass) = self.basic_auth();
        let response = http
            .get(format!("{}/v2/{repo_name}/manifests/{reference}", self.base_url()))
            .basic_auth(user, pass)
            .header(
                "Accept",
                format!(
                    "{},{},{},{}",
                    crate::manifest::media_types::OCI_MANIFEST_V1,
                    crate::manifest::media_types::OCI_INDEX_V1,
                    crate::manifest::media_types::DOCKER_MANIFEST_V2,
                    crate::manifest::media_types::DOCKER_MANIFEST_LIST_V2,
                ),
            )
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "upstream returned {} for {repo_name}:{reference}",
                response.status()
            )));
        }
        let media_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(crate::manifest::media_types::OCI_MANIFEST_V1)
            .to_string();
        let body = response.bytes().await.map_err(|e| Error::Upstream(e.to_string()))?.to_vec();
        ParsedManifest::parse(&media_type, &body)?;
        Ok((media_type, body))
    }

    async fn list_tags(&self, http: &reqwest::Client, repo_name: &str) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct TagsList {
            tags: Vec<String>,
        }

        let (user, pass) = self.basic_auth();
        let response = http
            .get(format!("{}/v2/{repo_name}/tags/list", self.base_url()))
            .basic_auth(user, pass)
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!("upstream returned {} listing tags for {repo_name}", response.status())));
        }
        let parsed: TagsList = response.json().await.map_err(|e| Error::Upstream(e.to_string()))?;
        Ok(parsed.tags)
    }
}

/// Whether an anonymous pull may proceed without the regular RBAC path
/// (spec.md §4.7: "permitted only on external-replica accounts;
/// anonymous pulls are only allowed for the first replication of a
/// given blob").
pub fn anonymous_first_pull_allowed(account: &Account, blob_already_exists: bool) -> bool {
    account.replication.is_external_replica() && !blob_already_exists
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fs::FsStorageDriver;
    use crate::store::mem::MemStore;
    use chrono::Utc;

    fn account(name: &str, replication: ReplicationStrategy) -> Account {
        let now = Utc::now();
        Account {
            name: name.parse().unwrap(),
            auth_tenant_id: "tenant-a".to_string(),
            replication,
            platform_filter: vec![],
            validation_rule: None,
            policies: Default::default(),
            metadata: Default::default(),
            next_blob_sweep_at: now,
            next_storage_sweep_at: now,
            next_federation_announce_at: now,
            is_deleting: false,
        }
    }

    #[test]
    fn anonymous_first_pull_only_for_external_replica_and_first_time() {
        let peer_replica = account(
            "peer-replica",
            ReplicationStrategy::OnFirstUse { upstream_peer_hostname: "peer.example.org".to_string() },
        );
        assert!(!anonymous_first_pull_allowed(&peer_replica, false));

        let external = account(
            "external-replica",
            ReplicationStrategy::FromExternalOnFirstUse {
                url: "https://upstream.example.org".to_string(),
                username: "anon".to_string(),
                password: None,
            },
        );
        assert!(anonymous_first_pull_allowed(&external, false));
        assert!(!anonymous_first_pull_allowed(&external, true));
    }

    #[tokio::test]
    async fn ensure_blob_mounted_reuses_an_existing_local_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemStore::new();
        let storage = FsStorageDriver::new(dir.path().to_path_buf());
        let acct = account("acct", ReplicationStrategy::None);
        store.put_account(acct.clone()).await.unwrap();
        let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();

        let digest = Digest::sha256(b"hello world");
        let blob = Blob {
            id: 0,
            account_name: acct.name.clone(),
            digest: digest.clone(),
            size_bytes: 11,
            storage_id: "existing".to_string(),
            media_type: "application/octet-stream".to_string(),
            pushed_at: Utc::now(),
            validated_at: None,
            validation_error_message: None,
            can_be_deleted_at: None,
            blocks_vuln_scanning: VulnScanBlock::Unknown,
        };
        store.insert_blob(blob, repo.id).await.unwrap();

        let engine = ReplicationEngine::new(&store, &storage);
        let cancel = CancellationToken::new();
        let mounted = engine.ensure_blob_mounted(&acct, repo.id, &digest, &cancel).await.unwrap();
        assert_eq!(mounted.digest.to_string(), digest.to_string());
    }

    #[tokio::test]
    async fn ensure_blob_mounted_without_upstream_fails_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemStore::new();
        let storage = FsStorageDriver::new(dir.path().to_path_buf());
        let acct = account("acct", ReplicationStrategy::None);
        store.put_account(acct.clone()).await.unwrap();
        let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();

        let engine = ReplicationEngine::new(&store, &storage);
        let cancel = CancellationToken::new();
        let digest = Digest::sha256(b"absent");
        let result = engine.ensure_blob_mounted(&acct, repo.id, &digest, &cancel).await;
        assert!(result.is_err());
    }
}
