//! Manifest parser (spec.md §4.6)
//!
//! A polymorphic view over the four media types a manifest push may
//! carry. Descriptor/Platform/ImageManifest/ImageIndex are grounded on
//! `rune::registry::server`'s shapes of the same name, extended with
//! `subject`/`artifact_type` (OCI 1.1 referrers) and the "none"-config
//! handling for ORAS-style artifacts that spec.md §4.6 calls for.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod media_types {
    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
}

/// The acceptable-alternate platform when a client only accepts
/// `docker v2 schema2` against a multi-arch tag (spec.md §9 Open
/// Questions, resolved in DESIGN.md: hard-coded to `linux/amd64`).
pub const ACCEPTABLE_ALTERNATE_PLATFORM: (&str, &str) = ("linux", "amd64");

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Media types that mark a config blob as "not a real image config" and
/// therefore exempt from the usual config-descriptor handling (spec.md
/// §4.6: ORAS artifacts and similar non-standard config media types).
fn is_non_standard_config(media_type: &str) -> bool {
    !(media_type == "application/vnd.oci.image.config.v1+json"
        || media_type == "application/vnd.docker.container.image.v1+json")
}

/// A parsed manifest body, dispatched on the pushed `media_type`
/// (spec.md §4.6). Unknown media types fail parsing.
#[derive(Debug, Clone)]
pub enum ParsedManifest {
    DockerList(ImageIndex),
    DockerSchema2(ImageManifest),
    OciIndex(ImageIndex),
    OciManifest(ImageManifest),
}

impl ParsedManifest {
    pub fn parse(media_type: &str, body: &[u8]) -> Result<Self> {
        match media_type {
            media_types::DOCKER_MANIFEST_LIST_V2 => {
                Ok(ParsedManifest::DockerList(serde_json::from_slice(body)?))
            }
            media_types::DOCKER_MANIFEST_V2 => {
                Ok(ParsedManifest::DockerSchema2(serde_json::from_slice(body)?))
            }
            media_types::OCI_INDEX_V1 => Ok(ParsedManifest::OciIndex(serde_json::from_slice(body)?)),
            media_types::OCI_MANIFEST_V1 => Ok(ParsedManifest::OciManifest(serde_json::from_slice(body)?)),
            other => Err(Error::ManifestInvalid(format!("unsupported manifest media type {other:?}"))),
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, ParsedManifest::DockerList(_) | ParsedManifest::OciIndex(_))
    }

    /// The image-config descriptor, or `None` if this is an index, or if
    /// the manifest's config media type marks it as a non-image artifact
    /// (spec.md §4.6: "the config-blob lookup returns none").
    pub fn config_descriptor(&self) -> Option<&Descriptor> {
        match self {
            ParsedManifest::DockerList(_) | ParsedManifest::OciIndex(_) => None,
            ParsedManifest::DockerSchema2(m) | ParsedManifest::OciManifest(m) => {
                if is_non_standard_config(&m.config.media_type) {
                    None
                } else {
                    Some(&m.config)
                }
            }
        }
    }

    /// This manifest's own annotations map (spec.md §4.5: manifest
    /// labels are sourced from the manifest document itself, not from
    /// parsing the image config blob). Empty for an index.
    pub fn annotations(&self) -> &HashMap<String, String> {
        match self {
            ParsedManifest::DockerList(idx) | ParsedManifest::OciIndex(idx) => &idx.annotations,
            ParsedManifest::DockerSchema2(m) | ParsedManifest::OciManifest(m) => &m.annotations,
        }
    }

    pub fn layer_descriptors(&self) -> &[Descriptor] {
        match self {
            ParsedManifest::DockerList(_) | ParsedManifest::OciIndex(_) => &[],
            ParsedManifest::DockerSchema2(m) | ParsedManifest::OciManifest(m) => &m.layers,
        }
    }

    /// Every blob this manifest references: config ∪ layers (spec.md
    /// §4.6). Empty for an index, since index members are manifests.
    pub fn referenced_blobs(&self) -> Vec<&Descriptor> {
        let mut out: Vec<&Descriptor> = Vec::new();
        if let Some(config) = self.config_descriptor() {
            out.push(config);
        }
        out.extend(self.layer_descriptors());
        out
    }

    /// Submanifest (index member) descriptors, filtered by `accepts`
    /// (spec.md §4.6, applied against the account's platform filter).
    pub fn submanifest_descriptors(&self, accepts: impl Fn(&Platform) -> bool) -> Vec<&Descriptor> {
        match self {
            ParsedManifest::DockerList(idx) | ParsedManifest::OciIndex(idx) => idx
                .manifests
                .iter()
                .filter(|d| d.platform.as_ref().map(&accepts).unwrap_or(true))
                .collect(),
            ParsedManifest::DockerSchema2(_) | ParsedManifest::OciManifest(_) => Vec::new(),
        }
    }

    /// The compat fallback: the `linux/amd64` member of a docker v2 list,
    /// served when the requesting client only accepts schema2 (spec.md
    /// §4.6, needed for `docker pull` against multi-arch tags).
    pub fn acceptable_alternates(&self) -> Vec<&Descriptor> {
        match self {
            ParsedManifest::DockerList(idx) | ParsedManifest::OciIndex(idx) => idx
                .manifests
                .iter()
                .filter(|d| {
                    d.platform
                        .as_ref()
                        .map(|p| {
                            (p.os.as_str(), p.architecture.as_str()) == ACCEPTABLE_ALTERNATE_PLATFORM
                        })
                        .unwrap_or(false)
                })
                .collect(),
            ParsedManifest::DockerSchema2(_) | ParsedManifest::OciManifest(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema2_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::DOCKER_MANIFEST_V2,
            "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "digest": "sha256:aaaa", "size": 10},
            "layers": [{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": "sha256:bbbb", "size": 20}],
        }))
        .unwrap()
    }

    #[test]
    fn parses_schema2_and_lists_referenced_blobs() {
        let parsed = ParsedManifest::parse(media_types::DOCKER_MANIFEST_V2, &schema2_body()).unwrap();
        assert!(!parsed.is_index());
        assert_eq!(parsed.referenced_blobs().len(), 2);
    }

    #[test]
    fn rejects_unknown_media_type() {
        assert!(ParsedManifest::parse("application/x-made-up", &schema2_body()).is_err());
    }

    #[test]
    fn oras_style_config_media_type_returns_none() {
        let body = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST_V1,
            "artifactType": "application/vnd.example.artifact",
            "config": {"mediaType": "application/vnd.oci.empty.v1+json", "digest": "sha256:cccc", "size": 2},
            "layers": [],
        }))
        .unwrap();
        let parsed = ParsedManifest::parse(media_types::OCI_MANIFEST_V1, &body).unwrap();
        assert!(parsed.config_descriptor().is_none());
    }

    #[test]
    fn index_exposes_submanifests_filtered_by_platform() {
        let body = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::DOCKER_MANIFEST_LIST_V2,
            "manifests": [
                {"mediaType": media_types::DOCKER_MANIFEST_V2, "digest": "sha256:amd64", "size": 1,
                 "platform": {"architecture": "amd64", "os": "linux"}},
                {"mediaType": media_types::DOCKER_MANIFEST_V2, "digest": "sha256:arm64", "size": 1,
                 "platform": {"architecture": "arm64", "os": "linux"}},
            ],
        }))
        .unwrap();
        let parsed = ParsedManifest::parse(media_types::DOCKER_MANIFEST_LIST_V2, &body).unwrap();
        assert!(parsed.is_index());
        assert_eq!(parsed.submanifest_descriptors(|_| true).len(), 2);
        assert_eq!(
            parsed.submanifest_descriptors(|p| p.architecture == "amd64").len(),
            1
        );
        let alternates = parsed.acceptable_alternates();
        assert_eq!(alternates.len(), 1);
        assert_eq!(alternates[0].digest, "sha256:amd64");
    }
}
