//! Blob, blob-mount, pending-blob and storage-reconciliation tombstone
//! records (spec.md §3).

use crate::ident::{AccountName, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state flag recording whether a blob should be excluded from
/// vulnerability scanning (spec.md §3 Blob: `blocks-vuln-scanning`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnScanBlock {
    Unknown,
    Blocked,
    Allowed,
}

/// An immutable content-addressed byte sequence (spec.md §3 Blob).
/// **Invariant I1**: a row exists iff the storage driver holds the
/// finalized object at `storage_id`; the janitor's storage sweep
/// reconciles drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub id: i64,
    pub account_name: AccountName,
    pub digest: Digest,
    pub size_bytes: i64,
    /// Fresh random identifier chosen at upload start, independent of
    /// `digest` so an upload can begin before the digest is known
    /// (spec.md §4.3).
    pub storage_id: String,
    pub media_type: String,
    pub pushed_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub validation_error_message: Option<String>,
    /// GC tombstone: set on first observation of "unreferenced", the
    /// row is deleted on the second (spec.md §4.8 blob sweep).
    pub can_be_deleted_at: Option<DateTime<Utc>>,
    pub blocks_vuln_scanning: VulnScanBlock,
}

/// The attachment of a blob to a repository (spec.md §3 BlobMount).
/// **Invariant I2**: every ManifestBlobRef requires a BlobMount to exist
/// for the same (blob, repo).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMount {
    pub blob_id: i64,
    pub repo_id: i64,
    pub can_be_deleted_at: Option<DateTime<Utc>>,
}

/// Reason a pending-blob lock was taken (spec.md §3 PendingBlob).
/// Currently only replication takes this lock; kept as an enum so a
/// future lock reason does not require a schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingBlobReason {
    Replication,
}

/// A presence lock: exists iff a replication for (account, digest) is in
/// progress (spec.md §3 PendingBlob, §4.7). **Invariant I4**: for a given
/// (account, digest) either a Blob or a PendingBlob exists, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBlob {
    pub account_name: AccountName,
    pub digest: Digest,
    pub reason: PendingBlobReason,
    pub since: DateTime<Utc>,
}

/// Storage-reconciliation tombstone for an object the storage listing
/// reports but the DB does not know about (spec.md §3, §4.8 storage sweep).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownBlob {
    pub account_name: AccountName,
    pub storage_id: String,
    pub can_be_deleted_at: DateTime<Utc>,
}

/// Same as [`UnknownBlob`] but for a manifest body found in storage with
/// no corresponding DB row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownManifest {
    pub account_name: AccountName,
    pub repo_name: String,
    pub digest: Digest,
    pub can_be_deleted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_tombstone_starts_unset() {
        let blob = Blob {
            id: 1,
            account_name: "acct".parse().unwrap(),
            digest: Digest::sha256(b"x"),
            size_bytes: 10,
            storage_id: "abc123".to_string(),
            media_type: "application/octet-stream".to_string(),
            pushed_at: Utc::now(),
            validated_at: None,
            validation_error_message: None,
            can_be_deleted_at: None,
            blocks_vuln_scanning: VulnScanBlock::Unknown,
        };
        assert!(blob.can_be_deleted_at.is_none());
    }
}
