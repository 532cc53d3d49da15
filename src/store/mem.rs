//! In-memory [`Store`] implementation.
//!
//! Used by unit/integration tests and by deployments too small to run
//! Postgres. A single `Mutex` around a plain-data `Inner` struct is
//! enough: every operation here is non-blocking CPU work, so there is
//! no `.await` inside the critical section.

use super::{AccountSweepKind, ManifestIngest, RepoSweepKind, Store};
use crate::error::{Error, Result};
use crate::model::{
    Account, Blob, BlobMount, Manifest, ManifestBlobRef, ManifestManifestRef, PendingBlob, Peer, Quota, Repository,
    Tag, TrivySecurityInfo, UnknownBlob, UnknownManifest, Upload,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    repositories: HashMap<(String, String), Repository>,
    next_repo_id: i64,

    blobs: HashMap<i64, Blob>,
    blob_by_digest: HashMap<(String, String), i64>,
    next_blob_id: i64,
    blob_mounts: HashMap<(i64, i64), BlobMount>,

    pending_blobs: HashMap<(String, String), PendingBlob>,

    uploads: HashMap<(i64, uuid::Uuid), Upload>,

    manifests: HashMap<(i64, String), Manifest>,
    manifest_contents: HashMap<(i64, String), Vec<u8>>,
    manifest_blob_refs: HashMap<(i64, String), Vec<ManifestBlobRef>>,
    /// All submanifest references in a repo, keyed by repo id.
    manifest_manifest_refs: HashMap<i64, Vec<ManifestManifestRef>>,

    tags: HashMap<(i64, String), Tag>,

    quotas: HashMap<String, Quota>,
    peers: HashMap<String, Peer>,

    unknown_blobs: HashMap<(String, String), UnknownBlob>,
    unknown_manifests: HashMap<(String, String, String), UnknownManifest>,

    trivy: HashMap<(i64, String), TrivySecurityInfo>,
}

pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_account(&self, name: &str) -> Result<Option<Account>> {
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.accounts.get(name).cloned())
    }

    async fn put_account(&self, account: Account) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.accounts.insert(account.name.to_string(), account);
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.accounts.values().cloned().collect())
    }

    async fn delete_account(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        inner.accounts.remove(name);
        inner.repositories.retain(|(acct, _), _| acct != name);
        Ok(())
    }

    async fn get_or_create_repository(&self, account: &str, repo_name: &str) -> Result<Repository> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let key = (account.to_string(), repo_name.to_string());
        if let Some(repo) = inner.repositories.get(&key) {
            return Ok(repo.clone());
        }
        inner.next_repo_id += 1;
        let id = inner.next_repo_id;
        let now = Utc::now();
        let repo = Repository {
            id,
            account_name: account.parse()?,
            name: repo_name.parse()?,
            next_blob_mount_sweep_at: now,
            next_manifest_sync_at: now,
            next_gc_at: now,
        };
        inner.repositories.insert(key, repo.clone());
        Ok(repo)
    }

    async fn get_repository(&self, account: &str, repo_name: &str) -> Result<Option<Repository>> {
        let key = (account.to_string(), repo_name.to_string());
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.repositories.get(&key).cloned())
    }

    async fn get_repository_by_id(&self, repo_id: i64) -> Result<Option<Repository>> {
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.repositories.values().find(|r| r.id == repo_id).cloned())
    }

    async fn get_blob(&self, account: &str, digest: &str) -> Result<Option<Blob>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let key = (account.to_string(), digest.to_string());
        Ok(inner.blob_by_digest.get(&key).and_then(|id| inner.blobs.get(id).cloned()))
    }

    async fn insert_blob(&self, mut blob: Blob, mount_repo_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        inner.next_blob_id += 1;
        blob.id = inner.next_blob_id;
        let key = (blob.account_name.to_string(), blob.digest.to_string());
        let id = blob.id;
        inner.blob_by_digest.insert(key, id);
        inner.blob_mounts.insert(
            (id, mount_repo_id),
            BlobMount { blob_id: id, repo_id: mount_repo_id, can_be_deleted_at: None },
        );
        inner.blobs.insert(id, blob);
        Ok(())
    }

    async fn get_blob_mount(&self, blob_id: i64, repo_id: i64) -> Result<Option<BlobMount>> {
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.blob_mounts.get(&(blob_id, repo_id)).cloned())
    }

    async fn insert_blob_mount(&self, mount: BlobMount) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.blob_mounts.insert((mount.blob_id, mount.repo_id), mount);
        Ok(())
    }

    async fn mark_blob_deletable(&self, blob_id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(blob) = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.blobs.get_mut(&blob_id) {
            blob.can_be_deleted_at = Some(at);
        }
        Ok(())
    }

    async fn delete_blob(&self, blob_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        if let Some(blob) = inner.blobs.remove(&blob_id) {
            let key = (blob.account_name.to_string(), blob.digest.to_string());
            inner.blob_by_digest.remove(&key);
        }
        inner.blob_mounts.retain(|(b, _), _| *b != blob_id);
        Ok(())
    }

    async fn unreferenced_blobs(&self, account: &str, limit: u32) -> Result<Vec<Blob>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let out = inner
            .blobs
            .values()
            .filter(|b| b.account_name.as_str() == account)
            .filter(|b| !inner.blob_mounts.keys().any(|(blob_id, _)| *blob_id == b.id))
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(out)
    }

    async fn account_has_blobs(&self, account: &str) -> Result<bool> {
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.blobs.values().any(|b| b.account_name.as_str() == account))
    }

    async fn blob_exists_by_storage_id(&self, account: &str, storage_id: &str) -> Result<bool> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner
            .blobs
            .values()
            .any(|b| b.account_name.as_str() == account && b.storage_id == storage_id))
    }

    async fn try_acquire_pending_blob(&self, pending: PendingBlob) -> Result<bool> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let key = (pending.account_name.to_string(), pending.digest.to_string());
        if inner.pending_blobs.contains_key(&key) {
            return Ok(false);
        }
        inner.pending_blobs.insert(key, pending);
        Ok(true)
    }

    async fn get_pending_blob(&self, account: &str, digest: &str) -> Result<Option<PendingBlob>> {
        let key = (account.to_string(), digest.to_string());
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.pending_blobs.get(&key).cloned())
    }

    async fn delete_pending_blob(&self, account: &str, digest: &str) -> Result<()> {
        let key = (account.to_string(), digest.to_string());
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.pending_blobs.remove(&key);
        Ok(())
    }

    async fn create_upload(&self, upload: Upload) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.uploads.insert((upload.repo_id, upload.uuid), upload);
        Ok(())
    }

    async fn get_upload(&self, repo_id: i64, uuid: uuid::Uuid) -> Result<Option<Upload>> {
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.uploads.get(&(repo_id, uuid)).cloned())
    }

    async fn update_upload(&self, upload: Upload) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.uploads.insert((upload.repo_id, upload.uuid), upload);
        Ok(())
    }

    async fn delete_upload(&self, repo_id: i64, uuid: uuid::Uuid) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.uploads.remove(&(repo_id, uuid));
        Ok(())
    }

    async fn get_manifest(&self, repo_id: i64, digest: &str) -> Result<Option<Manifest>> {
        let key = (repo_id, digest.to_string());
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.manifests.get(&key).cloned())
    }

    async fn get_manifest_content(&self, repo_id: i64, digest: &str) -> Result<Option<Vec<u8>>> {
        let key = (repo_id, digest.to_string());
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.manifest_contents.get(&key).cloned())
    }

    async fn manifest_blob_refs(&self, repo_id: i64, digest: &str) -> Result<Vec<ManifestBlobRef>> {
        let key = (repo_id, digest.to_string());
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.manifest_blob_refs.get(&key).cloned().unwrap_or_default())
    }

    async fn manifest_parent_refs(&self, repo_id: i64, child_digest: &str) -> Result<Vec<ManifestManifestRef>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner
            .manifest_manifest_refs
            .get(&repo_id)
            .into_iter()
            .flatten()
            .filter(|r| r.child_digest.to_string() == child_digest)
            .cloned()
            .collect())
    }

    async fn commit_manifest_ingest(&self, ingest: ManifestIngest) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let repo_id = ingest.manifest.repo_id;
        let digest = ingest.manifest.digest.to_string();

        inner.manifests.insert((repo_id, digest.clone()), ingest.manifest);
        inner
            .manifest_contents
            .insert((repo_id, digest.clone()), ingest.content.content);
        inner
            .manifest_blob_refs
            .insert((repo_id, digest.clone()), ingest.blob_refs);
        inner
            .manifest_manifest_refs
            .entry(repo_id)
            .or_default()
            .extend(ingest.manifest_refs.iter().cloned());
        if let Some(tag) = ingest.tag_upsert {
            inner.tags.insert((repo_id, tag.name.clone()), tag);
        }
        inner.trivy.insert((repo_id, digest), ingest.trivy_info);
        Ok(())
    }

    async fn delete_manifest(&self, repo_id: i64, digest: &str) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let key = (repo_id, digest.to_string());
        let referenced_by_parent = inner
            .manifest_manifest_refs
            .get(&repo_id)
            .into_iter()
            .flatten()
            .any(|r| r.child_digest.to_string() == digest);
        if referenced_by_parent {
            return Err(Error::Denied(format!(
                "manifest {digest} is still referenced by a parent manifest"
            )));
        }
        inner.manifests.remove(&key);
        inner.manifest_contents.remove(&key);
        inner.manifest_blob_refs.remove(&key);
        if let Some(refs) = inner.manifest_manifest_refs.get_mut(&repo_id) {
            refs.retain(|r| r.parent_digest.to_string() != digest);
        }
        inner.tags.retain(|_, tag| tag.digest.to_string() != digest || tag.repo_id != repo_id);
        Ok(())
    }

    async fn count_manifests_for_tenant(&self, auth_tenant_id: &str) -> Result<i64> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let tenant_accounts: Vec<String> = inner
            .accounts
            .values()
            .filter(|a| a.auth_tenant_id == auth_tenant_id)
            .map(|a| a.name.to_string())
            .collect();
        let repo_ids: Vec<i64> = inner
            .repositories
            .iter()
            .filter(|((acct, _), _)| tenant_accounts.contains(acct))
            .map(|(_, repo)| repo.id)
            .collect();
        let count = inner.manifests.keys().filter(|(repo_id, _)| repo_ids.contains(repo_id)).count();
        Ok(count as i64)
    }

    async fn get_tag(&self, repo_id: i64, name: &str) -> Result<Option<Tag>> {
        let key = (repo_id, name.to_string());
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.tags.get(&key).cloned())
    }

    async fn list_tags(&self, repo_id: i64) -> Result<Vec<Tag>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner.tags.iter().filter(|((r, _), _)| *r == repo_id).map(|(_, t)| t.clone()).collect())
    }

    async fn delete_tag(&self, repo_id: i64, name: &str) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.tags.remove(&(repo_id, name.to_string()));
        Ok(())
    }

    async fn get_quota(&self, auth_tenant_id: &str) -> Result<Option<Quota>> {
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.quotas.get(auth_tenant_id).cloned())
    }

    async fn put_quota(&self, quota: Quota) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.quotas.insert(quota.auth_tenant_id.clone(), quota);
        Ok(())
    }

    async fn get_peer(&self, hostname: &str) -> Result<Option<Peer>> {
        Ok(self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.peers.get(hostname).cloned())
    }

    async fn put_peer(&self, peer: Peer) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.peers.insert(peer.hostname.clone(), peer);
        Ok(())
    }

    async fn record_unknown_blob(&self, unknown: UnknownBlob) -> Result<()> {
        let key = (unknown.account_name.to_string(), unknown.storage_id.clone());
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.unknown_blobs.insert(key, unknown);
        Ok(())
    }

    async fn due_unknown_blobs(&self, account: &str, now: DateTime<Utc>, limit: u32) -> Result<Vec<UnknownBlob>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner
            .unknown_blobs
            .values()
            .filter(|u| u.account_name.as_str() == account && u.can_be_deleted_at <= now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn clear_unknown_blob(&self, account: &str, storage_id: &str) -> Result<()> {
        let key = (account.to_string(), storage_id.to_string());
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.unknown_blobs.remove(&key);
        Ok(())
    }

    async fn record_unknown_manifest(&self, unknown: UnknownManifest) -> Result<()> {
        let key = (unknown.account_name.to_string(), unknown.repo_name.clone(), unknown.digest.to_string());
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.unknown_manifests.insert(key, unknown);
        Ok(())
    }

    async fn due_unknown_manifests(
        &self,
        account: &str,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UnknownManifest>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner
            .unknown_manifests
            .values()
            .filter(|u| u.account_name.as_str() == account && u.can_be_deleted_at <= now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn clear_unknown_manifest(&self, account: &str, repo_name: &str, digest: &str) -> Result<()> {
        let key = (account.to_string(), repo_name.to_string(), digest.to_string());
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.unknown_manifests.remove(&key);
        Ok(())
    }

    async fn upsert_trivy_info(&self, info: TrivySecurityInfo) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.trivy.insert((info.repo_id, info.digest.clone()), info);
        Ok(())
    }

    async fn due_trivy_checks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<TrivySecurityInfo>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner
            .trivy
            .values()
            .filter(|t| t.next_check_at <= now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn due_accounts_for(&self, kind: AccountSweepKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Account>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner
            .accounts
            .values()
            .filter(|a| account_next_at(a, kind) <= now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn reschedule_account(&self, name: &str, kind: AccountSweepKind, next_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        if let Some(account) = inner.accounts.get_mut(name) {
            set_account_next_at(account, kind, next_at);
        }
        Ok(())
    }

    async fn due_repositories_for(&self, kind: RepoSweepKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Repository>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner
            .repositories
            .values()
            .filter(|r| repo_next_at(r, kind) <= now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn reschedule_repository(&self, repo_id: i64, kind: RepoSweepKind, next_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        if let Some(repo) = inner.repositories.values_mut().find(|r| r.id == repo_id) {
            set_repo_next_at(repo, kind, next_at);
        }
        Ok(())
    }

    async fn list_manifests(&self, repo_id: i64) -> Result<Vec<Manifest>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner.manifests.values().filter(|m| m.repo_id == repo_id).cloned().collect())
    }

    async fn manifest_has_children(&self, repo_id: i64, parent_digest: &str) -> Result<bool> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        Ok(inner
            .manifest_manifest_refs
            .get(&repo_id)
            .map(|refs| refs.iter().any(|r| r.parent_digest.to_string() == parent_digest))
            .unwrap_or(false))
    }

    async fn unreferenced_mounts(&self, repo_id: i64, limit: u32) -> Result<Vec<BlobMount>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let referenced_blob_ids: std::collections::HashSet<i64> = inner
            .manifest_blob_refs
            .iter()
            .filter(|((rid, _), _)| *rid == repo_id)
            .flat_map(|(_, refs)| refs.iter().map(|r| r.blob_id))
            .collect();
        Ok(inner
            .blob_mounts
            .values()
            .filter(|m| m.repo_id == repo_id && !referenced_blob_ids.contains(&m.blob_id))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_mount_deletable(&self, blob_id: i64, repo_id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(mount) = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.blob_mounts.get_mut(&(blob_id, repo_id)) {
            mount.can_be_deleted_at = Some(at);
        }
        Ok(())
    }

    async fn delete_blob_mount(&self, blob_id: i64, repo_id: i64) -> Result<()> {
        self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.blob_mounts.remove(&(blob_id, repo_id));
        Ok(())
    }

    async fn blobs_due_for_validation(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Blob>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let mut due: Vec<Blob> = inner
            .blobs
            .values()
            .filter(|b| b.validated_at.map(|at| at < before).unwrap_or(true))
            .cloned()
            .collect();
        due.sort_by_key(|b| b.validated_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn manifests_due_for_validation(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Manifest>> {
        let inner = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?;
        let mut due: Vec<Manifest> = inner
            .manifests
            .values()
            .filter(|m| m.validated_at.map(|at| at < before).unwrap_or(true))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.validated_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn update_blob_validation(
        &self,
        blob_id: i64,
        validated_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<()> {
        if let Some(blob) = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.blobs.get_mut(&blob_id) {
            blob.validated_at = Some(validated_at);
            blob.validation_error_message = error_message;
        }
        Ok(())
    }

    async fn update_manifest_validation(
        &self,
        repo_id: i64,
        digest: &str,
        validated_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<()> {
        if let Some(manifest) = self.inner.lock().map_err(|_| Error::Internal("lock poisoned".into()))?.manifests.get_mut(&(repo_id, digest.to_string())) {
            manifest.validated_at = Some(validated_at);
            manifest.validation_error_message = error_message;
        }
        Ok(())
    }
}

fn account_next_at(account: &Account, kind: AccountSweepKind) -> DateTime<Utc> {
    match kind {
        AccountSweepKind::BlobSweep => account.next_blob_sweep_at,
        AccountSweepKind::StorageSweep => account.next_storage_sweep_at,
        AccountSweepKind::FederationAnnounce => account.next_federation_announce_at,
    }
}

fn set_account_next_at(account: &mut Account, kind: AccountSweepKind, at: DateTime<Utc>) {
    match kind {
        AccountSweepKind::BlobSweep => account.next_blob_sweep_at = at,
        AccountSweepKind::StorageSweep => account.next_storage_sweep_at = at,
        AccountSweepKind::FederationAnnounce => account.next_federation_announce_at = at,
    }
}

fn repo_next_at(repo: &Repository, kind: RepoSweepKind) -> DateTime<Utc> {
    match kind {
        RepoSweepKind::MountSweep => repo.next_blob_mount_sweep_at,
        RepoSweepKind::ManifestSync => repo.next_manifest_sync_at,
        RepoSweepKind::Gc => repo.next_gc_at,
    }
}

fn set_repo_next_at(repo: &mut Repository, kind: RepoSweepKind, at: DateTime<Utc>) {
    match kind {
        RepoSweepKind::MountSweep => repo.next_blob_mount_sweep_at = at,
        RepoSweepKind::ManifestSync => repo.next_manifest_sync_at = at,
        RepoSweepKind::Gc => repo.next_gc_at = at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::Digest;
    use crate::model::VulnScanBlock;

    fn blob(account: &str, digest: &str) -> Blob {
        Blob {
            id: 0,
            account_name: account.parse().unwrap(),
            digest: digest.parse().unwrap(),
            size_bytes: 10,
            storage_id: "sid".to_string(),
            media_type: "application/octet-stream".to_string(),
            pushed_at: Utc::now(),
            validated_at: None,
            validation_error_message: None,
            can_be_deleted_at: None,
            blocks_vuln_scanning: VulnScanBlock::Unknown,
        }
    }

    #[tokio::test]
    async fn repository_auto_vivifies_once() {
        let store = MemStore::new();
        let a = store.get_or_create_repository("acct", "library/nginx").await.unwrap();
        let b = store.get_or_create_repository("acct", "library/nginx").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn insert_blob_also_creates_mount() {
        let store = MemStore::new();
        let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();
        store.insert_blob(blob("acct", "sha256:aaaa"), repo.id).await.unwrap();
        let got = store.get_blob("acct", "sha256:aaaa").await.unwrap().unwrap();
        let mount = store.get_blob_mount(got.id, repo.id).await.unwrap();
        assert!(mount.is_some());
    }

    #[tokio::test]
    async fn pending_blob_lock_is_exclusive() {
        let store = MemStore::new();
        let pending = PendingBlob {
            account_name: "acct".parse().unwrap(),
            digest: Digest::sha256(b"x"),
            reason: crate::model::PendingBlobReason::Replication,
            since: Utc::now(),
        };
        assert!(store.try_acquire_pending_blob(pending.clone()).await.unwrap());
        assert!(!store.try_acquire_pending_blob(pending).await.unwrap());
    }

    #[tokio::test]
    async fn delete_manifest_fails_while_referenced_by_parent() {
        use crate::model::{GcStatus, Manifest};
        let store = MemStore::new();
        let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();
        let child = Manifest {
            repo_id: repo.id,
            digest: "sha256:child".parse().unwrap(),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            size_bytes: 1,
            pushed_at: Utc::now(),
            validated_at: None,
            validation_error_message: None,
            last_pulled_at: None,
            min_layer_created_at: None,
            max_layer_created_at: None,
            labels: Default::default(),
            gc_status: GcStatus::default(),
        };
        store
            .commit_manifest_ingest(ManifestIngest {
                manifest: child,
                content: crate::model::ManifestContent {
                    repo_id: repo.id,
                    digest: "sha256:child".parse().unwrap(),
                    content: b"{}".to_vec(),
                },
                blob_refs: vec![],
                manifest_refs: vec![ManifestManifestRef {
                    repo_id: repo.id,
                    parent_digest: "sha256:parent".parse().unwrap(),
                    child_digest: "sha256:child".parse().unwrap(),
                }],
                tag_upsert: None,
                trivy_info: TrivySecurityInfo::queued(repo.id, "sha256:child", Utc::now()),
            })
            .await
            .unwrap();

        assert!(store.delete_manifest(repo.id, "sha256:child").await.is_err());
    }
}
