//! Chunked upload record (spec.md §3 Upload, §4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resumable cross-request state for a chunked blob upload, identified
/// by (repo, uuid) (spec.md §3 Upload). Destroyed on finalize (converted
/// to a [`crate::model::Blob`]) or abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub repo_id: i64,
    pub uuid: uuid::Uuid,
    pub storage_id: String,
    pub size_bytes: i64,
    /// Rolling SHA256 of bytes received so far, persisted after every
    /// chunk so a crash mid-upload loses no digest progress.
    pub digest_state_hex: String,
    pub chunk_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    pub fn new(repo_id: i64, storage_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        use sha2::{Digest as _, Sha256};
        Self {
            repo_id,
            uuid: uuid::Uuid::new_v4(),
            storage_id: storage_id.into(),
            size_bytes: 0,
            digest_state_hex: hex::encode(Sha256::new().finalize()),
            chunk_count: 0,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_upload_starts_at_zero() {
        let upload = Upload::new(1, "deadbeef", Utc::now());
        assert_eq!(upload.size_bytes, 0);
        assert_eq!(upload.chunk_count, 0);
    }
}
