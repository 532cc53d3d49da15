//! Wire-facing types and constants the HTTP edge (out of scope here)
//! would serve (spec.md §6): the peer-protocol `_sync_replica` payload,
//! the header names used by manifest/blob responses and anycast
//! forwarding, and assembly of the sync payload from the `Store`. The
//! Account JSON shape and the OCI error envelope already live on
//! [`crate::model::account::Account`] and [`crate::error::ErrorResponse`]
//! respectively, since those types derive their own wire serialization.

pub use crate::model::peer::{ReplicaSyncManifest, ReplicaSyncPayload, ReplicaSyncTag};

use crate::error::Result;
use crate::store::Store;

/// Response header carrying a manifest's or blob's canonical digest on
/// every manifest/blob response (spec.md §6 "Wire protocol").
pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Request header an anycast-forwarded request carries only `Accept`
/// and this header's sibling `Authorization` through to the owning peer
/// (spec.md §6 "Peer protocol").
pub const X_KEPPEL_FORWARDED_BY: &str = "X-Keppel-Forwarded-By";

/// Response header on upload-chunk PATCH/POST, carrying the upload's
/// resumable location (spec.md §6 "Wire protocol").
pub const LOCATION: &str = "Location";

/// Assemble the `_sync_replica` response body for `repo_id`: every
/// manifest in the repository with its last-pulled-at timestamp and the
/// tags currently pointing at it (spec.md §6 "Peer protocol").
pub async fn build_replica_sync_payload(store: &dyn Store, repo_id: i64) -> Result<ReplicaSyncPayload> {
    let manifests = store.list_manifests(repo_id).await?;
    let tags = store.list_tags(repo_id).await?;

    let payload_manifests = manifests
        .into_iter()
        .map(|manifest| {
            let digest = manifest.digest.to_string();
            let manifest_tags = tags
                .iter()
                .filter(|tag| tag.digest.to_string() == digest)
                .map(|tag| ReplicaSyncTag { name: tag.name.clone(), last_pulled_at: tag.last_pulled_at })
                .collect();
            ReplicaSyncManifest { digest, last_pulled_at: manifest.last_pulled_at, tags: manifest_tags }
        })
        .collect();

    Ok(ReplicaSyncPayload { manifests: payload_manifests })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::Digest;
    use crate::model::{Manifest, ManifestContent, Tag, TrivySecurityInfo};
    use crate::store::{ManifestIngest, Store};
    use crate::store::mem::MemStore;
    use chrono::Utc;

    #[tokio::test]
    async fn assembles_manifests_with_their_tags() {
        let store = MemStore::new();
        let repo = store.get_or_create_repository("acct", "library/nginx").await.unwrap();

        let digest = Digest::sha256(b"manifest-body");
        let now = Utc::now();
        let manifest = Manifest {
            repo_id: repo.id,
            digest: digest.clone(),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            size_bytes: 13,
            pushed_at: now,
            validated_at: None,
            validation_error_message: None,
            last_pulled_at: None,
            min_layer_created_at: None,
            max_layer_created_at: None,
            labels: Default::default(),
            gc_status: Default::default(),
        };
        let tag = Tag { repo_id: repo.id, name: "latest".to_string(), digest: digest.clone(), pushed_at: now, last_pulled_at: None };
        store
            .commit_manifest_ingest(ManifestIngest {
                manifest,
                content: ManifestContent { repo_id: repo.id, digest: digest.clone(), content: b"manifest-body".to_vec() },
                blob_refs: vec![],
                manifest_refs: vec![],
                tag_upsert: Some(tag),
                trivy_info: TrivySecurityInfo::queued(repo.id, digest.to_string(), now),
            })
            .await
            .unwrap();

        let payload = build_replica_sync_payload(&store, repo.id).await.unwrap();
        assert_eq!(payload.manifests.len(), 1);
        assert_eq!(payload.manifests[0].digest, digest.to_string());
        assert_eq!(payload.manifests[0].tags.len(), 1);
        assert_eq!(payload.manifests[0].tags[0].name, "latest");
    }
}
