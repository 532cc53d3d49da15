//! Validation sweep (spec.md §4.8): periodically re-read a blob or
//! manifest body from storage and re-hash it, catching storage-layer
//! bit-rot that a purely transactional DB view would never notice.

use super::{Sweep, SweepOutcome};
use crate::error::Result;
use crate::ident::Digest;
use crate::storage::StorageDriver;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct ValidationSweep {
    store: Arc<dyn Store>,
    storage: Arc<dyn StorageDriver>,
    validation_age: chrono::Duration,
}

impl ValidationSweep {
    pub fn new(store: Arc<dyn Store>, storage: Arc<dyn StorageDriver>, validation_age: Duration) -> Self {
        Self {
            store,
            storage,
            validation_age: chrono::Duration::from_std(validation_age).unwrap_or(chrono::Duration::days(7)),
        }
    }
}

#[async_trait]
impl Sweep for ValidationSweep {
    fn name(&self) -> &'static str {
        "validation_sweep"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let before = now - self.validation_age;
        let cancel = CancellationToken::new();

        if let Some(blob) = self.store.blobs_due_for_validation(before, 1).await?.into_iter().next() {
            let error = match self.storage.read_blob(blob.account_name.as_str(), &blob.storage_id, &cancel).await {
                Ok(bytes) if Digest::sha256(&bytes).to_string() == blob.digest.to_string() => None,
                Ok(_) => Some("stored content no longer matches its digest".to_string()),
                Err(err) => Some(err.to_string()),
            };
            if let Some(error) = &error {
                warn!(account = blob.account_name.as_str(), digest = %blob.digest, error = error.as_str(), "blob revalidation failed");
            }
            self.store.update_blob_validation(blob.id, now, error).await?;
            return Ok(SweepOutcome::one());
        }

        if let Some(manifest) = self.store.manifests_due_for_validation(before, 1).await?.into_iter().next() {
            let Some(repo) = self.store.get_repository_by_id(manifest.repo_id).await? else {
                return Ok(SweepOutcome::NOTHING_DUE);
            };
            let digest = manifest.digest.to_string();
            let error = match self
                .storage
                .read_manifest(repo.account_name.as_str(), repo.name.as_str(), &digest, &cancel)
                .await
            {
                Ok(bytes) if Digest::sha256(&bytes).to_string() == digest => None,
                Ok(_) => Some("stored content no longer matches its digest".to_string()),
                Err(err) => Some(err.to_string()),
            };
            if let Some(error) = &error {
                warn!(account = repo.account_name.as_str(), repo = repo.name.as_str(), digest = digest.as_str(), error = error.as_str(), "manifest revalidation failed");
            }
            self.store.update_manifest_validation(manifest.repo_id, &digest, now, error).await?;
            return Ok(SweepOutcome::one());
        }

        Ok(SweepOutcome::NOTHING_DUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Blob, VulnScanBlock};
    use crate::storage::fs::FsStorageDriver;
    use crate::store::mem::MemStore;

    #[tokio::test]
    async fn revalidates_an_unvalidated_blob_and_records_success() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let storage: Arc<dyn StorageDriver> = Arc::new(FsStorageDriver::new(dir.path().to_path_buf()));
        let cancel = CancellationToken::new();
        storage.append_to_blob("acct", "sid1", 1, Some(5), b"hello", &cancel).await.unwrap();
        storage.finalize_blob("acct", "sid1", 1, &cancel).await.unwrap();

        let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();
        let digest = Digest::sha256(b"hello");
        let blob = Blob {
            id: 0,
            account_name: "acct".parse().unwrap(),
            digest: digest.clone(),
            size_bytes: 5,
            storage_id: "sid1".to_string(),
            media_type: "application/octet-stream".to_string(),
            pushed_at: Utc::now(),
            validated_at: None,
            validation_error_message: None,
            can_be_deleted_at: None,
            blocks_vuln_scanning: VulnScanBlock::Unknown,
        };
        store.insert_blob(blob, repo.id).await.unwrap();

        let sweep = ValidationSweep::new(store.clone(), storage, Duration::from_secs(7 * 86400));
        let outcome = sweep.run_once().await.unwrap();
        assert_eq!(outcome.processed, 1);

        let blob = store.get_blob("acct", &digest.to_string()).await.unwrap().unwrap();
        assert!(blob.validated_at.is_some());
        assert!(blob.validation_error_message.is_none());
    }
}
