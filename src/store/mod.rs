//! Persistence layer (spec.md §3, §3.1 expansion)
//!
//! [`Store`] is the one seam between the engines (upload, ingest,
//! replication, janitor) and a concrete database. [`pg::PgStore`] is the
//! production `sqlx`/Postgres implementation; [`mem::MemStore`] is an
//! in-memory implementation used by tests and by any deployment small
//! enough not to need Postgres.

pub mod mem;
pub mod pg;

use crate::error::Result;
use crate::model::{
    Account, Blob, BlobMount, Manifest, ManifestBlobRef, ManifestContent, ManifestManifestRef, PendingBlob, Peer,
    Quota, Repository, Tag, TrivySecurityInfo, UnknownBlob, UnknownManifest, Upload,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Which per-account `next_…_at` column a scheduler query targets
/// (spec.md §3 Account, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountSweepKind {
    BlobSweep,
    StorageSweep,
    FederationAnnounce,
}

/// Which per-repository `next_…_at` column a scheduler query targets
/// (spec.md §3 Repository, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoSweepKind {
    MountSweep,
    ManifestSync,
    Gc,
}

/// Everything persisted by a successful manifest ingest (spec.md §4.5
/// step 7), handed to the store as one unit so implementations can wrap
/// it in a single transaction.
pub struct ManifestIngest {
    pub manifest: Manifest,
    pub content: ManifestContent,
    pub blob_refs: Vec<ManifestBlobRef>,
    pub manifest_refs: Vec<ManifestManifestRef>,
    pub tag_upsert: Option<Tag>,
    pub trivy_info: TrivySecurityInfo,
}

/// The persistence seam consumed by every engine (spec.md §3, §4.4,
/// §4.5, §4.7, §4.8). Implementations are responsible for their own
/// transaction boundaries and row-locking strategy (`FOR UPDATE SKIP
/// LOCKED` or equivalent, spec.md §5).
#[async_trait]
pub trait Store: Send + Sync {
    // -- accounts --------------------------------------------------
    async fn get_account(&self, name: &str) -> Result<Option<Account>>;
    async fn put_account(&self, account: Account) -> Result<()>;
    async fn list_accounts(&self) -> Result<Vec<Account>>;
    async fn delete_account(&self, name: &str) -> Result<()>;

    // -- repositories ------------------------------------------------
    /// Fetch a repository, auto-vivifying it on first write (spec.md §3
    /// Repository: "Auto-vivified on first write").
    async fn get_or_create_repository(&self, account: &str, repo_name: &str) -> Result<Repository>;
    async fn get_repository(&self, account: &str, repo_name: &str) -> Result<Option<Repository>>;
    async fn get_repository_by_id(&self, repo_id: i64) -> Result<Option<Repository>>;

    // -- blobs ---------------------------------------------------------
    async fn get_blob(&self, account: &str, digest: &str) -> Result<Option<Blob>>;
    async fn insert_blob(&self, blob: Blob, mount_repo_id: i64) -> Result<()>;
    async fn get_blob_mount(&self, blob_id: i64, repo_id: i64) -> Result<Option<BlobMount>>;
    async fn insert_blob_mount(&self, mount: BlobMount) -> Result<()>;
    async fn mark_blob_deletable(&self, blob_id: i64, at: DateTime<Utc>) -> Result<()>;
    async fn delete_blob(&self, blob_id: i64) -> Result<()>;
    async fn unreferenced_blobs(&self, account: &str, limit: u32) -> Result<Vec<Blob>>;
    /// Whether `account` still owns any blob row (spec.md §4.8 account
    /// reconcile: an account marked `is_deleting` is only dropped once
    /// the blob sweep has drained its content).
    async fn account_has_blobs(&self, account: &str) -> Result<bool>;
    /// Whether any blob row for `account` points at `storage_id` (spec.md
    /// §4.8 storage sweep: reverse lookup from a listed storage object
    /// back to the DB).
    async fn blob_exists_by_storage_id(&self, account: &str, storage_id: &str) -> Result<bool>;

    // -- pending blobs (replication lock, spec.md §4.7, invariant I4) --
    /// Atomically insert iff absent; returns `true` if this call won
    /// the race and created the lock.
    async fn try_acquire_pending_blob(&self, pending: PendingBlob) -> Result<bool>;
    async fn get_pending_blob(&self, account: &str, digest: &str) -> Result<Option<PendingBlob>>;
    async fn delete_pending_blob(&self, account: &str, digest: &str) -> Result<()>;

    // -- uploads ---------------------------------------------------
    async fn create_upload(&self, upload: Upload) -> Result<()>;
    async fn get_upload(&self, repo_id: i64, uuid: uuid::Uuid) -> Result<Option<Upload>>;
    async fn update_upload(&self, upload: Upload) -> Result<()>;
    async fn delete_upload(&self, repo_id: i64, uuid: uuid::Uuid) -> Result<()>;

    // -- manifests -------------------------------------------------
    async fn get_manifest(&self, repo_id: i64, digest: &str) -> Result<Option<Manifest>>;
    async fn get_manifest_content(&self, repo_id: i64, digest: &str) -> Result<Option<Vec<u8>>>;
    async fn manifest_blob_refs(&self, repo_id: i64, digest: &str) -> Result<Vec<ManifestBlobRef>>;
    async fn manifest_parent_refs(&self, repo_id: i64, child_digest: &str) -> Result<Vec<ManifestManifestRef>>;
    /// Persist a fully-validated manifest push as one unit (spec.md
    /// §4.5 step 7).
    async fn commit_manifest_ingest(&self, ingest: ManifestIngest) -> Result<()>;
    async fn delete_manifest(&self, repo_id: i64, digest: &str) -> Result<()>;
    async fn count_manifests_for_tenant(&self, auth_tenant_id: &str) -> Result<i64>;

    // -- tags ----------------------------------------------------------
    async fn get_tag(&self, repo_id: i64, name: &str) -> Result<Option<Tag>>;
    async fn list_tags(&self, repo_id: i64) -> Result<Vec<Tag>>;
    async fn delete_tag(&self, repo_id: i64, name: &str) -> Result<()>;

    // -- quotas ----------------------------------------------------
    async fn get_quota(&self, auth_tenant_id: &str) -> Result<Option<Quota>>;
    async fn put_quota(&self, quota: Quota) -> Result<()>;

    // -- peers -----------------------------------------------------
    async fn get_peer(&self, hostname: &str) -> Result<Option<Peer>>;
    async fn put_peer(&self, peer: Peer) -> Result<()>;

    // -- storage reconciliation tombstones (spec.md §4.8 storage sweep)
    async fn record_unknown_blob(&self, unknown: UnknownBlob) -> Result<()>;
    async fn due_unknown_blobs(&self, account: &str, now: DateTime<Utc>, limit: u32) -> Result<Vec<UnknownBlob>>;
    async fn clear_unknown_blob(&self, account: &str, storage_id: &str) -> Result<()>;
    async fn record_unknown_manifest(&self, unknown: UnknownManifest) -> Result<()>;
    async fn due_unknown_manifests(
        &self,
        account: &str,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UnknownManifest>>;
    async fn clear_unknown_manifest(&self, account: &str, repo_name: &str, digest: &str) -> Result<()>;

    // -- vulnerability scanning (spec.md §4.8 vuln_check) -----------
    async fn upsert_trivy_info(&self, info: TrivySecurityInfo) -> Result<()>;
    async fn due_trivy_checks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<TrivySecurityInfo>>;

    // -- janitor scheduling (spec.md §4.8: "pick the single row with the
    // earliest next_…_at ≤ now") ------------------------------------
    async fn due_accounts_for(&self, kind: AccountSweepKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Account>>;
    async fn reschedule_account(&self, name: &str, kind: AccountSweepKind, next_at: DateTime<Utc>) -> Result<()>;
    async fn due_repositories_for(&self, kind: RepoSweepKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Repository>>;
    async fn reschedule_repository(&self, repo_id: i64, kind: RepoSweepKind, next_at: DateTime<Utc>) -> Result<()>;

    // -- janitor sweep support queries --------------------------------
    async fn list_manifests(&self, repo_id: i64) -> Result<Vec<Manifest>>;
    /// Whether any other manifest in `repo_id` references `parent_digest`
    /// as a submanifest (spec.md §4.8 manifest GC: `delete_if_no_children`).
    async fn manifest_has_children(&self, repo_id: i64, parent_digest: &str) -> Result<bool>;
    /// Mounts in `repo_id` whose blob no longer has a `manifest_blob_refs`
    /// row in that repo (spec.md §4.8 blob-mount sweep).
    async fn unreferenced_mounts(&self, repo_id: i64, limit: u32) -> Result<Vec<BlobMount>>;
    /// Tombstone a mount for later deletion, mirroring `mark_blob_deletable`'s
    /// two-phase "mark, then sweep" contract (spec.md §4.8 blob-mount sweep).
    async fn mark_mount_deletable(&self, blob_id: i64, repo_id: i64, at: DateTime<Utc>) -> Result<()>;
    async fn delete_blob_mount(&self, blob_id: i64, repo_id: i64) -> Result<()>;

    // -- validation (spec.md §4.8 validation sweep) -------------------
    /// Blobs never validated, or last validated before `before`,
    /// oldest first (spec.md §4.8 validation sweep: re-hash stored
    /// content to catch storage bit-rot).
    async fn blobs_due_for_validation(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Blob>>;
    async fn manifests_due_for_validation(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Manifest>>;
    async fn update_blob_validation(
        &self,
        blob_id: i64,
        validated_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<()>;
    async fn update_manifest_validation(
        &self,
        repo_id: i64,
        digest: &str,
        validated_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<()>;
}
