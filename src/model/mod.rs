//! Data model (spec.md §3)
//!
//! Strongly-typed record structs mirroring the persistent schema. These
//! are plain data; read/write behavior lives behind the [`crate::store::Store`]
//! trait so the engines never depend on a concrete database.

mod account;
mod blob;
mod manifest;
mod peer;
mod quota;
mod repository;
mod tag;
mod trivy;
mod upload;

pub use account::{Account, PlatformFilter, ReplicationStrategy};
pub use blob::{Blob, BlobMount, PendingBlob, PendingBlobReason, UnknownBlob, UnknownManifest, VulnScanBlock};
pub use manifest::{Manifest, ManifestBlobRef, ManifestContent, ManifestManifestRef};
pub use peer::{Peer, ReplicaSyncManifest, ReplicaSyncPayload, ReplicaSyncTag};
pub use quota::Quota;
pub use repository::Repository;
pub use tag::Tag;
pub use trivy::{TrivySecurityInfo, VulnStatus};
pub use upload::Upload;
