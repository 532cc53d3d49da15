//! Manifest GC sweep (spec.md §4.8): evaluate each manifest in a due
//! repository against its account's GC policies and delete the ones a
//! policy marks for deletion.

use super::{Sweep, SweepOutcome};
use crate::error::{Error, Result};
use crate::policy::gc::{self, GcDecision, GcManifestFacts};
use crate::storage::StorageDriver;
use crate::store::{RepoSweepKind, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ManifestGc {
    store: Arc<dyn Store>,
    storage: Arc<dyn StorageDriver>,
    reschedule_interval: chrono::Duration,
}

impl ManifestGc {
    pub fn new(store: Arc<dyn Store>, storage: Arc<dyn StorageDriver>, reschedule_interval: Duration) -> Self {
        Self {
            store,
            storage,
            reschedule_interval: chrono::Duration::from_std(reschedule_interval).unwrap_or(chrono::Duration::minutes(1)),
        }
    }
}

#[async_trait]
impl Sweep for ManifestGc {
    fn name(&self) -> &'static str {
        "manifest_gc"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let due = self.store.due_repositories_for(RepoSweepKind::Gc, now, 1).await?;
        let Some(repo) = due.into_iter().next() else {
            return Ok(SweepOutcome::NOTHING_DUE);
        };
        let account = self
            .store
            .get_account(repo.account_name.as_str())
            .await?
            .ok_or_else(|| Error::Internal(format!("account {} for repository {} vanished", repo.account_name, repo.id)))?;

        let tags = self.store.list_tags(repo.id).await?;
        let cancel = CancellationToken::new();
        for manifest in self.store.list_manifests(repo.id).await? {
            let digest = manifest.digest.to_string();
            let manifest_tags: Vec<String> =
                tags.iter().filter(|t| t.digest.to_string() == digest).map(|t| t.name.clone()).collect();
            let is_referenced_by_parent = !self.store.manifest_parent_refs(repo.id, &digest).await?.is_empty();
            let has_children = self.store.manifest_has_children(repo.id, &digest).await?;

            let facts = GcManifestFacts {
                repo_name: repo.name.as_str(),
                tags: &manifest_tags,
                pushed_at: manifest.pushed_at,
                is_referenced_by_parent,
                has_children,
            };
            if gc::evaluate(&account.policies.gc_policies, &facts) == GcDecision::Delete {
                self.storage
                    .delete_manifest(repo.account_name.as_str(), repo.name.as_str(), &digest, &cancel)
                    .await?;
                self.store.delete_manifest(repo.id, &digest).await?;
                info!(account = repo.account_name.as_str(), repo = repo.name.as_str(), digest = digest.as_str(), "gc deleted manifest");
            }
        }

        self.store
            .reschedule_repository(repo.id, RepoSweepKind::Gc, now + self.reschedule_interval)
            .await?;
        Ok(SweepOutcome::one())
    }
}
