//! Filesystem-backed reference [`StorageDriver`] (spec.md §4.3)
//!
//! Grounded on the teacher's `RegistryStorage` path layout
//! (`blobs/sha256/<hash>`, per-repo manifest trees), adapted to the
//! account-scoped, chunked-append contract this engine requires:
//! storage IDs decoupled from digests, explicit finalize/abort, and
//! dense monotonically-increasing chunk numbers.

use super::{AppendResult, BlobUrl, ReportFormat, StorageContents, StorageDriver, StoredManifestKey};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Sidecar tracking the last chunk number written to an in-progress
/// upload, so `append_to_blob` can reject out-of-order chunks.
#[derive(Debug, Serialize, Deserialize)]
struct UploadMeta {
    last_chunk_number: u64,
    size_bytes: u64,
}

pub struct FsStorageDriver {
    root: PathBuf,
}

impl FsStorageDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn account_root(&self, account: &str) -> PathBuf {
        self.root.join(account)
    }

    fn staging_path(&self, account: &str, storage_id: &str) -> PathBuf {
        self.account_root(account).join("staging").join(storage_id)
    }

    fn meta_path(&self, account: &str, storage_id: &str) -> PathBuf {
        self.account_root(account).join("staging").join(format!("{storage_id}.meta"))
    }

    fn blob_path(&self, account: &str, storage_id: &str) -> PathBuf {
        self.account_root(account).join("blobs").join(storage_id)
    }

    fn manifest_path(&self, account: &str, repo_name: &str, digest: &str) -> PathBuf {
        self.account_root(account)
            .join("manifests")
            .join(repo_name)
            .join(digest)
    }

    fn trivy_path(&self, account: &str, repo_name: &str, digest: &str, format: ReportFormat) -> PathBuf {
        let ext = match format {
            ReportFormat::Json => "json",
        };
        self.account_root(account)
            .join("trivy")
            .join(repo_name)
            .join(format!("{digest}.{ext}"))
    }

    async fn read_meta(&self, account: &str, storage_id: &str) -> Result<UploadMeta> {
        let bytes = fs::read(self.meta_path(account, storage_id)).await?;
        serde_json::from_slice(&bytes).map_err(Error::Json)
    }

    async fn write_meta(&self, account: &str, storage_id: &str, meta: &UploadMeta) -> Result<()> {
        let bytes = serde_json::to_vec(meta).map_err(Error::Json)?;
        fs::write(self.meta_path(account, storage_id), bytes).await?;
        Ok(())
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for FsStorageDriver {
    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_number: u64,
        expected_total_length: Option<u64>,
        chunk: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<AppendResult> {
        let staging = self.staging_path(account, storage_id);
        Self::ensure_parent(&staging).await?;

        let meta = if chunk_number == 1 {
            UploadMeta { last_chunk_number: 0, size_bytes: 0 }
        } else {
            self.read_meta(account, storage_id).await?
        };
        if chunk_number != meta.last_chunk_number + 1 {
            return Err(Error::UploadInvalid(format!(
                "chunk {chunk_number} is not the next expected chunk (last was {})",
                meta.last_chunk_number
            )));
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staging)
            .await?;
        file.write_all(chunk).await?;
        file.flush().await?;

        let new_size = meta.size_bytes + chunk.len() as u64;
        if let Some(expected) = expected_total_length {
            if new_size > expected {
                return Err(Error::SizeInvalid(format!(
                    "upload exceeded expected length {expected}"
                )));
            }
        }
        self.write_meta(
            account,
            storage_id,
            &UploadMeta { last_chunk_number: chunk_number, size_bytes: new_size },
        )
        .await?;

        let accumulated = fs::read(&staging).await?;
        let digest_hex = hex::encode(<sha2::Sha256 as sha2::Digest>::digest(&accumulated));
        Ok(AppendResult { size_bytes: new_size, digest_hex })
    }

    async fn finalize_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_count: u64,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let meta = self.read_meta(account, storage_id).await?;
        if meta.last_chunk_number != chunk_count {
            return Err(Error::UploadInvalid(format!(
                "expected {chunk_count} chunks, saw {}",
                meta.last_chunk_number
            )));
        }
        let staging = self.staging_path(account, storage_id);
        let finalized = self.blob_path(account, storage_id);
        Self::ensure_parent(&finalized).await?;
        // Idempotent: a prior call may have already renamed the file if the
        // DB commit failed afterward.
        if staging.exists() {
            fs::rename(&staging, &finalized).await?;
        } else if !finalized.exists() {
            return Err(Error::Internal(format!("no staged upload found for {storage_id}")));
        }
        let _ = fs::remove_file(self.meta_path(account, storage_id)).await;
        Ok(())
    }

    async fn abort_blob_upload(
        &self,
        account: &str,
        storage_id: &str,
        _chunk_count: u64,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let _ = fs::remove_file(self.staging_path(account, storage_id)).await;
        let _ = fs::remove_file(self.meta_path(account, storage_id)).await;
        Ok(())
    }

    async fn read_blob(&self, account: &str, storage_id: &str, _cancel: &CancellationToken) -> Result<Vec<u8>> {
        fs::read(self.blob_path(account, storage_id))
            .await
            .map_err(|_| Error::BlobUnknown(storage_id.to_string()))
    }

    async fn url_for_blob(&self, _account: &str, _storage_id: &str, _cancel: &CancellationToken) -> Result<BlobUrl> {
        Ok(BlobUrl::Unsupported)
    }

    async fn delete_blob(&self, account: &str, storage_id: &str, _cancel: &CancellationToken) -> Result<()> {
        fs::remove_file(self.blob_path(account, storage_id))
            .await
            .map_err(Error::Io)
    }

    async fn read_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        fs::read(self.manifest_path(account, repo_name, digest))
            .await
            .map_err(|_| Error::ManifestUnknown(digest.to_string()))
    }

    async fn write_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        content: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let path = self.manifest_path(account, repo_name, digest);
        Self::ensure_parent(&path).await?;
        fs::write(path, content).await?;
        Ok(())
    }

    async fn delete_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let path = self.manifest_path(account, repo_name, digest);
        if path.exists() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn read_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: ReportFormat,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        fs::read(self.trivy_path(account, repo_name, digest, format))
            .await
            .map_err(|_| Error::Internal(format!("no scan report for {digest}")))
    }

    async fn write_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: ReportFormat,
        content: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let path = self.trivy_path(account, repo_name, digest, format);
        Self::ensure_parent(&path).await?;
        fs::write(path, content).await?;
        Ok(())
    }

    async fn delete_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: ReportFormat,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let path = self.trivy_path(account, repo_name, digest, format);
        if path.exists() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn list_storage_contents(&self, account: &str, _cancel: &CancellationToken) -> Result<StorageContents> {
        let mut contents = StorageContents::default();
        let blobs_dir = self.account_root(account).join("blobs");
        if blobs_dir.exists() {
            let mut entries = fs::read_dir(&blobs_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    contents.blob_storage_ids.push(name.to_string());
                }
            }
        }
        let manifests_dir = self.account_root(account).join("manifests");
        if manifests_dir.exists() {
            Self::collect_manifests(&manifests_dir, "", &mut contents.manifests).await?;
        }
        Ok(contents)
    }

    async fn can_setup_account(&self, account: &str, _cancel: &CancellationToken) -> Result<()> {
        fs::create_dir_all(self.account_root(account)).await?;
        Ok(())
    }

    async fn cleanup_account(&self, account: &str, _cancel: &CancellationToken) -> Result<()> {
        let root = self.account_root(account);
        if root.exists() {
            fs::remove_dir_all(root).await?;
        }
        Ok(())
    }
}

impl FsStorageDriver {
    fn collect_manifests<'a>(
        dir: &'a Path,
        repo_prefix: &'a str,
        out: &'a mut Vec<StoredManifestKey>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let name = entry.file_name().to_string_lossy().to_string();
                if file_type.is_dir() {
                    let nested_prefix = if repo_prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{repo_prefix}/{name}")
                    };
                    Self::collect_manifests(&entry.path(), &nested_prefix, out).await?;
                } else if file_type.is_file() {
                    out.push(StoredManifestKey {
                        repo_name: repo_prefix.to_string(),
                        digest: name,
                    });
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn upload_finalize_read_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let driver = FsStorageDriver::new(temp.path());
        let cancel = token();
        driver.can_setup_account("acct", &cancel).await.unwrap();

        let storage_id = "deadbeef";
        driver
            .append_to_blob("acct", storage_id, 1, None, b"hello ", &cancel)
            .await
            .unwrap();
        driver
            .append_to_blob("acct", storage_id, 2, None, b"world", &cancel)
            .await
            .unwrap();
        driver.finalize_blob("acct", storage_id, 2, &cancel).await.unwrap();

        let bytes = driver.read_blob("acct", storage_id, &cancel).await.unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn out_of_order_chunk_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let driver = FsStorageDriver::new(temp.path());
        let cancel = token();
        driver
            .append_to_blob("acct", "sid", 1, None, b"a", &cancel)
            .await
            .unwrap();
        let err = driver
            .append_to_blob("acct", "sid", 3, None, b"b", &cancel)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn abort_discards_staged_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let driver = FsStorageDriver::new(temp.path());
        let cancel = token();
        driver
            .append_to_blob("acct", "sid", 1, None, b"a", &cancel)
            .await
            .unwrap();
        driver.abort_blob_upload("acct", "sid", 1, &cancel).await.unwrap();
        assert!(driver.read_blob("acct", "sid", &cancel).await.is_err());
    }

    #[tokio::test]
    async fn manifest_write_read_delete() {
        let temp = tempfile::tempdir().unwrap();
        let driver = FsStorageDriver::new(temp.path());
        let cancel = token();
        driver
            .write_manifest("acct", "library/nginx", "sha256:aaaa", b"{}", &cancel)
            .await
            .unwrap();
        let content = driver
            .read_manifest("acct", "library/nginx", "sha256:aaaa", &cancel)
            .await
            .unwrap();
        assert_eq!(content, b"{}");
        driver
            .delete_manifest("acct", "library/nginx", "sha256:aaaa", &cancel)
            .await
            .unwrap();
        assert!(driver
            .read_manifest("acct", "library/nginx", "sha256:aaaa", &cancel)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_storage_contents_enumerates_blobs_and_manifests() {
        let temp = tempfile::tempdir().unwrap();
        let driver = FsStorageDriver::new(temp.path());
        let cancel = token();
        driver
            .append_to_blob("acct", "sid1", 1, None, b"x", &cancel)
            .await
            .unwrap();
        driver.finalize_blob("acct", "sid1", 1, &cancel).await.unwrap();
        driver
            .write_manifest("acct", "library/nginx", "sha256:aaaa", b"{}", &cancel)
            .await
            .unwrap();

        let contents = driver.list_storage_contents("acct", &cancel).await.unwrap();
        assert_eq!(contents.blob_storage_ids, vec!["sid1".to_string()]);
        assert_eq!(contents.manifests.len(), 1);
        assert_eq!(contents.manifests[0].repo_name, "library/nginx");
    }
}
