//! Chunked upload engine (spec.md §4.4)
//!
//! Implements the `uploads` row's state machine: Initial → Staging(n) →
//! Finalized/Aborted. The monolithic `POST .../uploads/?digest=D` path
//! is the same machine with exactly one chunk, so it is not modeled
//! separately — callers just call [`UploadEngine::append_chunk`] once
//! then [`UploadEngine::finalize`].

use crate::error::{Error, Result};
use crate::ident::Digest;
use crate::model::Upload;
use crate::storage::StorageDriver;
use crate::store::Store;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of a successful finalize: either a genuinely new blob, or an
/// existing one reused via cross-repo mount (spec.md §4.4: "If the blob
/// already exists for the account, reuse it").
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Created(crate::model::Blob),
    Reused(crate::model::Blob),
}

impl FinalizeOutcome {
    pub fn blob(&self) -> &crate::model::Blob {
        match self {
            FinalizeOutcome::Created(b) | FinalizeOutcome::Reused(b) => b,
        }
    }
}

pub struct UploadEngine<'a> {
    pub store: &'a dyn Store,
    pub storage: &'a dyn StorageDriver,
}

impl<'a> UploadEngine<'a> {
    pub fn new(store: &'a dyn Store, storage: &'a dyn StorageDriver) -> Self {
        Self { store, storage }
    }

    /// Begin a new upload (Initial state).
    pub async fn start(&self, repo_id: i64, now: DateTime<Utc>) -> Result<Upload> {
        let storage_id = crate::storage::new_storage_id();
        let upload = Upload::new(repo_id, storage_id, now);
        self.store.create_upload(upload.clone()).await?;
        Ok(upload)
    }

    /// Append one chunk (Staging transition). `content_range_start` is
    /// the offset the client claims this chunk begins at; it must equal
    /// the persisted size so far, or the resumption is rejected with a
    /// gap error (spec.md §4.4: "rejects gaps (status 416)" — the HTTP
    /// edge is responsible for mapping this error to 416 specifically).
    pub async fn append_chunk(
        &self,
        account: &str,
        mut upload: Upload,
        content_range_start: u64,
        expected_total_length: Option<u64>,
        chunk: &[u8],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Upload> {
        if content_range_start != upload.size_bytes as u64 {
            return Err(Error::UploadInvalid(format!(
                "Content-Range start {content_range_start} does not match persisted size {} (gap)",
                upload.size_bytes
            )));
        }

        let chunk_number = upload.chunk_count as u64 + 1;
        let appended = self
            .storage
            .append_to_blob(account, &upload.storage_id, chunk_number, expected_total_length, chunk, cancel)
            .await?;

        // The driver computes the rolling digest since it is the only
        // party holding the partial bytes between requests.
        upload.digest_state_hex = appended.digest_hex;
        upload.size_bytes = appended.size_bytes as i64;
        upload.chunk_count = chunk_number as i64;
        upload.updated_at = now;

        self.store.update_upload(upload.clone()).await?;
        Ok(upload)
    }

    /// Finalize the upload against a client-claimed digest (spec.md
    /// §4.4). On digest mismatch, aborts storage and fails
    /// `DIGEST_INVALID` without creating a blob.
    pub async fn finalize(
        &self,
        account: &str,
        mount_repo_id: i64,
        upload: Upload,
        claimed_digest: &Digest,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<FinalizeOutcome> {
        let computed = Digest::new("sha256", upload.digest_state_hex.clone());
        if computed.hex() != claimed_digest.hex() || claimed_digest.algo() != "sha256" {
            self.storage
                .abort_blob_upload(account, &upload.storage_id, upload.chunk_count as u64, cancel)
                .await?;
            self.store.delete_upload(upload.repo_id, upload.uuid).await?;
            warn!(account, claimed = %claimed_digest, computed = %computed, "upload finalize rejected: digest mismatch");
            return Err(Error::DigestInvalid(format!(
                "claimed digest {claimed_digest} does not match computed {computed}"
            )));
        }

        if let Some(existing) = self.store.get_blob(account, &claimed_digest.to_string()).await? {
            self.storage
                .abort_blob_upload(account, &upload.storage_id, upload.chunk_count as u64, cancel)
                .await?;
            self.store
                .insert_blob_mount(crate::model::BlobMount {
                    blob_id: existing.id,
                    repo_id: mount_repo_id,
                    can_be_deleted_at: None,
                })
                .await?;
            self.store.delete_upload(upload.repo_id, upload.uuid).await?;
            info!(account, digest = %claimed_digest, repo = mount_repo_id, "upload finalize reused existing blob");
            return Ok(FinalizeOutcome::Reused(existing));
        }

        self.storage
            .finalize_blob(account, &upload.storage_id, upload.chunk_count as u64, cancel)
            .await?;

        let blob = crate::model::Blob {
            id: 0,
            account_name: account.parse()?,
            digest: claimed_digest.clone(),
            size_bytes: upload.size_bytes,
            storage_id: upload.storage_id.clone(),
            media_type: "application/octet-stream".to_string(),
            pushed_at: now,
            validated_at: None,
            validation_error_message: None,
            can_be_deleted_at: None,
            blocks_vuln_scanning: crate::model::VulnScanBlock::Unknown,
        };
        self.store.insert_blob(blob.clone(), mount_repo_id).await?;
        self.store.delete_upload(upload.repo_id, upload.uuid).await?;

        let persisted = self
            .store
            .get_blob(account, &claimed_digest.to_string())
            .await?
            .unwrap_or(blob);
        info!(account, digest = %claimed_digest, repo = mount_repo_id, "upload finalized to a new blob");
        Ok(FinalizeOutcome::Created(persisted))
    }

    /// Abort the upload, discarding its storage bytes.
    pub async fn abort(&self, account: &str, upload: Upload, cancel: &CancellationToken) -> Result<()> {
        self.storage
            .abort_blob_upload(account, &upload.storage_id, upload.chunk_count as u64, cancel)
            .await?;
        self.store.delete_upload(upload.repo_id, upload.uuid).await?;
        Ok(())
    }
}
