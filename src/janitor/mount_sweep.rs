//! Blob-mount sweep (spec.md §4.8: tombstone a mount no longer backed
//! by a `manifest_blob_refs` row, then delete it once the grace period
//! has passed; mirrors the blob sweep one level down).

use super::{Sweep, SweepOutcome};
use crate::error::Result;
use crate::store::{RepoSweepKind, Store};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct MountSweep {
    store: Arc<dyn Store>,
    reschedule_interval: chrono::Duration,
    grace_period: chrono::Duration,
    batch_size: u32,
}

impl MountSweep {
    pub fn new(store: Arc<dyn Store>, reschedule_interval: Duration, grace_period: Duration) -> Self {
        Self {
            store,
            reschedule_interval: chrono::Duration::from_std(reschedule_interval).unwrap_or(chrono::Duration::seconds(30)),
            grace_period: chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::hours(6)),
            batch_size: 50,
        }
    }
}

#[async_trait]
impl Sweep for MountSweep {
    fn name(&self) -> &'static str {
        "mount_sweep"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let due = self.store.due_repositories_for(RepoSweepKind::MountSweep, now, 1).await?;
        let Some(repo) = due.into_iter().next() else {
            return Ok(SweepOutcome::NOTHING_DUE);
        };

        for mount in self.store.unreferenced_mounts(repo.id, self.batch_size).await? {
            match mount.can_be_deleted_at {
                None => {
                    debug!(repo = repo.id, blob_id = mount.blob_id, "tombstoning unreferenced mount");
                    self.store.mark_mount_deletable(mount.blob_id, repo.id, now + self.grace_period).await?;
                }
                Some(at) if at <= now => {
                    self.store.delete_blob_mount(mount.blob_id, repo.id).await?;
                    info!(repo = repo.id, blob_id = mount.blob_id, "deleted unreferenced mount");
                }
                Some(_) => {}
            }
        }

        self.store
            .reschedule_repository(repo.id, RepoSweepKind::MountSweep, now + self.reschedule_interval)
            .await?;
        Ok(SweepOutcome::one())
    }
}
