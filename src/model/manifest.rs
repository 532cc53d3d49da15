//! Manifest and its side tables (spec.md §3 Manifest).

use crate::ident::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// GC status recorded against a manifest by the manifest-GC sweep
/// (spec.md §3 Manifest: "GC status (JSON)", §4.8 manifest GC).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected_by_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevant_policy_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
}

/// A JSON document describing an image, identified by (repo, digest)
/// (spec.md §3 Manifest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub repo_id: i64,
    pub digest: Digest,
    pub media_type: String,
    pub size_bytes: i64,
    pub pushed_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub validation_error_message: Option<String>,
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub min_layer_created_at: Option<DateTime<Utc>>,
    pub max_layer_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub gc_status: GcStatus,
}

/// (repo, digest) → raw manifest body, stored inline for re-serving and
/// for walking references without a storage round-trip (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestContent {
    pub repo_id: i64,
    pub digest: Digest,
    pub content: Vec<u8>,
}

/// Every blob a manifest references; constrained to a blob-mount of the
/// same (blob, repo) existing (spec.md §3: RESTRICT on blob delete,
/// CASCADE on manifest delete, **invariant I2**).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestBlobRef {
    pub repo_id: i64,
    pub digest: Digest,
    pub blob_id: i64,
}

/// A submanifest reference, e.g. a multi-arch index member (spec.md §3:
/// RESTRICT on child delete, CASCADE on parent delete).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestManifestRef {
    pub repo_id: i64,
    pub parent_digest: Digest,
    pub child_digest: Digest,
}
