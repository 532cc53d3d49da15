//! Manifest ingest engine (spec.md §4.5)
//!
//! Implements the eight-step transactional manifest push: parse, verify
//! referenced blobs and submanifests are mountable (triggering
//! replication for replica accounts), apply validation and tag policy,
//! check quota, then persist everything as one unit through
//! [`crate::store::Store::commit_manifest_ingest`].

use crate::error::{Error, Result};
use crate::ident::Digest;
use crate::manifest::{Descriptor, ParsedManifest};
use crate::model::{Account, Manifest, ManifestBlobRef, ManifestContent, ManifestManifestRef, Tag, TrivySecurityInfo};
use crate::policy::validation::{self, ManifestFacts, ProgramCache};
use crate::policy::{tag as tag_policy, MatchRule};
use crate::replication::ReplicationEngine;
use crate::storage::StorageDriver;
use crate::store::{ManifestIngest, Store};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Which kind of reference a manifest was pushed under (spec.md §4.5:
/// "Reference is either a digest (strict: must equal sha256(body)) or a
/// tag (may be any valid tag)").
pub enum Reference<'a> {
    Tag(&'a str),
    Digest(Digest),
}

pub struct PutManifestRequest<'a> {
    pub account: &'a Account,
    pub repo_id: i64,
    pub repo_name: &'a str,
    pub reference: Reference<'a>,
    pub media_type: &'a str,
    pub body: &'a [u8],
}

pub struct IngestEngine<'a> {
    store: &'a dyn Store,
    storage: &'a dyn StorageDriver,
    validation_cache: &'a ProgramCache,
    replication: Option<&'a ReplicationEngine<'a>>,
}

impl<'a> IngestEngine<'a> {
    pub fn new(store: &'a dyn Store, storage: &'a dyn StorageDriver, validation_cache: &'a ProgramCache) -> Self {
        Self { store, storage, validation_cache, replication: None }
    }

    /// Attach a replication engine so step 2 can pull through blobs
    /// missing locally on replica accounts (spec.md §4.5 step 2).
    pub fn with_replication(mut self, replication: &'a ReplicationEngine<'a>) -> Self {
        self.replication = Some(replication);
        self
    }

    pub async fn put_manifest(
        &self,
        req: PutManifestRequest<'_>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Manifest> {
        let parsed = ParsedManifest::parse(req.media_type, req.body)?;

        // Step 1 (parse) is done; resolve the digest this push commits
        // under, enforcing the strict digest-reference invariant.
        let digest = match &req.reference {
            Reference::Digest(d) => {
                let computed = Digest::sha256(req.body);
                if computed.hex() != d.hex() {
                    return Err(Error::DigestInvalid(format!(
                        "reference digest {d} does not match sha256(body) {computed}"
                    )));
                }
                d.clone()
            }
            Reference::Tag(_) => Digest::sha256(req.body),
        };

        // Step 2: every referenced blob must already be mounted here.
        let mut blob_refs = Vec::with_capacity(parsed.referenced_blobs().len());
        for descriptor in parsed.referenced_blobs() {
            let blob_id = self.require_blob_mounted(req.account, req.repo_id, descriptor, cancel).await?;
            blob_refs.push(ManifestBlobRef { repo_id: req.repo_id, digest: descriptor.digest.parse()?, blob_id });
        }

        // Step 3: every submanifest must already exist in this repo.
        let mut manifest_refs = Vec::new();
        if parsed.is_index() {
            for descriptor in parsed.submanifest_descriptors(|_| true) {
                self.require_submanifest_exists(req.repo_id, descriptor).await?;
                manifest_refs.push(ManifestManifestRef {
                    repo_id: req.repo_id,
                    parent_digest: digest.clone(),
                    child_digest: descriptor.digest.parse()?,
                });
            }
        }

        let existing_tags = self.store.list_tags(req.repo_id).await?;
        let mut effective_tags: Vec<String> = existing_tags
            .iter()
            .filter(|t| t.digest.hex() == digest.hex())
            .map(|t| t.name.clone())
            .collect();
        if let Reference::Tag(name) = &req.reference {
            if !effective_tags.iter().any(|t| t == name) {
                effective_tags.push(name.to_string());
            }
        }

        let facts = ManifestFacts {
            labels: parsed.annotations().clone().into_iter().collect(),
            layers: parsed.layer_descriptors().iter().map(descriptor_to_map).collect(),
            media_type: req.media_type.to_string(),
            repo_name: req.repo_name.to_string(),
        };

        // Step 4: the account's validation rule, wrapped as a single
        // always-matching policy so it can reuse the shared evaluator.
        if let Some(expression) = &req.account.validation_rule {
            let policies = [validation::ValidationPolicy {
                rule: MatchRule {
                    repository: ".*".to_string(),
                    negative_repository: None,
                    tag: None,
                    negative_tag: None,
                },
                expression: expression.clone(),
            }];
            validation::evaluate(self.validation_cache, &policies, &effective_tags, &facts)?;
        }

        // Step 5: tag policy.
        if tag_policy::blocks_push(&req.account.policies.tag_policies, req.repo_name, &effective_tags) {
            return Err(Error::Denied(format!("manifest push to {} is blocked by a tag policy", req.repo_name)));
        }

        // Step 6: quota.
        if let Some(quota) = self.store.get_quota(&req.account.auth_tenant_id).await? {
            let current = self.store.count_manifests_for_tenant(&req.account.auth_tenant_id).await?;
            if !quota.allows_one_more(current) {
                return Err(Error::Denied(format!(
                    "auth tenant {} is at its manifest quota ({} manifests)",
                    req.account.auth_tenant_id, quota.manifest_count_limit
                )));
            }
        }

        // Step 7: persist the manifest body to storage, then the rows.
        self.storage
            .write_manifest(req.account.name.as_str(), req.repo_name, &digest.to_string(), req.body, cancel)
            .await?;

        let manifest = Manifest {
            repo_id: req.repo_id,
            digest: digest.clone(),
            media_type: req.media_type.to_string(),
            size_bytes: req.body.len() as i64,
            pushed_at: now,
            validated_at: Some(now),
            validation_error_message: None,
            last_pulled_at: None,
            min_layer_created_at: None,
            max_layer_created_at: None,
            labels: facts.labels.clone(),
            gc_status: Default::default(),
        };

        let tag_upsert = match &req.reference {
            Reference::Tag(name) => {
                Some(Tag { repo_id: req.repo_id, name: name.to_string(), digest: digest.clone(), pushed_at: now, last_pulled_at: None })
            }
            Reference::Digest(_) => None,
        };

        // Step 8: queue vulnerability scanning.
        let trivy_info = TrivySecurityInfo::queued(req.repo_id, digest.to_string(), now);

        self.store
            .commit_manifest_ingest(ManifestIngest {
                manifest: manifest.clone(),
                content: ManifestContent { repo_id: req.repo_id, digest: digest.clone(), content: req.body.to_vec() },
                blob_refs,
                manifest_refs,
                tag_upsert,
                trivy_info,
            })
            .await?;

        info!(
            account = req.account.name.as_str(),
            repo = req.repo_name,
            digest = %digest,
            tags = ?effective_tags,
            "ingested manifest"
        );
        Ok(manifest)
    }

    /// Step 2 for a single descriptor: resolve its blob id, requiring a
    /// mount in `repo_id` to exist or be creatable. Replica accounts
    /// pull the blob through on demand (spec.md §4.5 step 2, §4.7).
    async fn require_blob_mounted(
        &self,
        account: &Account,
        repo_id: i64,
        descriptor: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let digest: Digest = descriptor.digest.parse()?;
        if let Some(blob) = self.store.get_blob(account.name.as_str(), &digest.to_string()).await? {
            if self.store.get_blob_mount(blob.id, repo_id).await?.is_some() {
                return Ok(blob.id);
            }
        }
        if account.replication.is_replica() {
            if let Some(replication) = self.replication {
                let mounted = replication.ensure_blob_mounted(account, repo_id, &digest, cancel).await?;
                return Ok(mounted.id);
            }
        }
        Err(Error::ManifestBlobUnknown(format!("blob {digest} is not mounted in this repository")))
    }

    /// Delete a tag, honoring any `block_delete` tag policy (spec.md
    /// §4.2, §4.5's sibling operation to [`Self::put_manifest`]).
    pub async fn delete_tag(&self, account: &Account, repo_id: i64, repo_name: &str, tag_name: &str) -> Result<()> {
        if tag_policy::blocks_delete(&account.policies.tag_policies, repo_name, tag_name) {
            return Err(Error::Denied(format!(
                "deleting tag {tag_name} in {repo_name} is blocked by a tag policy"
            )));
        }
        self.store.delete_tag(repo_id, tag_name).await?;
        info!(account = account.name.as_str(), repo = repo_name, tag = tag_name, "deleted tag");
        Ok(())
    }

    async fn require_submanifest_exists(&self, repo_id: i64, descriptor: &Descriptor) -> Result<()> {
        let digest: Digest = descriptor.digest.parse()?;
        match self.store.get_manifest(repo_id, &digest.to_string()).await? {
            Some(_) => Ok(()),
            None => Err(Error::ManifestBlobUnknown(format!("submanifest {digest} does not exist in this repository"))),
        }
    }
}

fn descriptor_to_map(descriptor: &Descriptor) -> BTreeMap<String, serde_json::Value> {
    match serde_json::to_value(descriptor) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}
