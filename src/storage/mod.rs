//! Storage-driver contract (spec.md §4.3)
//!
//! The engine treats storage as an append-only object store per
//! account with explicit staging for chunked blob uploads. Concrete
//! backends implement [`StorageDriver`]; the core never depends on a
//! specific one.

pub mod fs;

use crate::error::Result;
use async_trait::async_trait;
use rand::RngCore;
use tokio_util::sync::CancellationToken;

/// A fresh 32-byte random hex storage identifier, decoupled from
/// digests so an upload can begin before the digest is known (spec.md
/// §4.3).
pub fn new_storage_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Either a redirect URL the caller should follow, or an indication
/// that the driver has no direct-URL support for blob reads (spec.md
/// §4.3: `URLForBlob` "returning either a redirect URL or 'not
/// supported'").
#[derive(Debug, Clone)]
pub enum BlobUrl {
    Redirect(String),
    Unsupported,
}

/// Scan-report serialization format, keyed alongside (account, repo,
/// digest) (spec.md §3 TrivySecurityInfo, §6 Persistent state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
}

/// Result of appending one chunk: the driver is the only party holding
/// the partial bytes, so it is also where the rolling digest required
/// by spec.md §4.4 ("every PATCH computes the running SHA256
/// incrementally") is cheapest to compute.
#[derive(Debug, Clone)]
pub struct AppendResult {
    pub size_bytes: u64,
    pub digest_hex: String,
}

/// Positive enumeration of objects a storage backend actually holds for
/// an account (spec.md §4.3 `ListStorageContents`: "never treat absence
/// as proof").
#[derive(Debug, Clone, Default)]
pub struct StorageContents {
    pub blob_storage_ids: Vec<String>,
    pub manifests: Vec<StoredManifestKey>,
}

#[derive(Debug, Clone)]
pub struct StoredManifestKey {
    pub repo_name: String,
    pub digest: String,
}

/// The abstract interface the core consumes from pluggable backends
/// (spec.md §4.3). Every operation accepts a [`CancellationToken`] so
/// callers (request handlers, janitor sweeps, replication) can bound
/// how long they wait on storage I/O.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Append chunk `chunk_number` (1-based, dense, monotonically
    /// increasing per `storage_id`) to an in-progress blob upload.
    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_number: u64,
        expected_total_length: Option<u64>,
        chunk: &[u8],
        cancel: &CancellationToken,
    ) -> Result<AppendResult>;

    /// Finalize a blob upload after `chunk_count` chunks have been
    /// appended. Idempotent-safe: callers may retry a finalize whose DB
    /// commit failed after a successful driver-side finalize.
    async fn finalize_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_count: u64,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Abort an in-progress or finalized-but-uncommitted upload,
    /// discarding its bytes.
    async fn abort_blob_upload(
        &self,
        account: &str,
        storage_id: &str,
        chunk_count: u64,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn read_blob(&self, account: &str, storage_id: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;

    async fn url_for_blob(&self, account: &str, storage_id: &str, cancel: &CancellationToken) -> Result<BlobUrl>;

    async fn delete_blob(&self, account: &str, storage_id: &str, cancel: &CancellationToken) -> Result<()>;

    async fn read_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    async fn write_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        content: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn delete_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn read_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: ReportFormat,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    async fn write_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: ReportFormat,
        content: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn delete_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: ReportFormat,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Positive enumeration of everything stored for `account`, used by
    /// the storage-reconciliation sweep.
    async fn list_storage_contents(&self, account: &str, cancel: &CancellationToken) -> Result<StorageContents>;

    /// Lifecycle hook called when an account is first set up.
    async fn can_setup_account(&self, account: &str, cancel: &CancellationToken) -> Result<()>;

    /// Lifecycle hook called once an account's contents have been fully
    /// torn down.
    async fn cleanup_account(&self, account: &str, cancel: &CancellationToken) -> Result<()>;
}
