//! Vulnerability check sweep (spec.md §4.8 vulnerability check): scan
//! the next due `TrivySecurityInfo` row and record the result.

use super::{Sweep, SweepOutcome};
use crate::error::{Error, Result};
use crate::model::{TrivySecurityInfo, VulnStatus};
use crate::scanner::ScannerClient;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct VulnCheck {
    store: Arc<dyn Store>,
    scanner: Arc<dyn ScannerClient>,
    recheck_interval: chrono::Duration,
}

impl VulnCheck {
    pub fn new(store: Arc<dyn Store>, scanner: Arc<dyn ScannerClient>, recheck_interval: Duration) -> Self {
        Self {
            store,
            scanner,
            recheck_interval: chrono::Duration::from_std(recheck_interval).unwrap_or(chrono::Duration::hours(24)),
        }
    }
}

#[async_trait]
impl Sweep for VulnCheck {
    fn name(&self) -> &'static str {
        "vuln_check"
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let due = self.store.due_trivy_checks(now, 1).await?;
        let Some(info) = due.into_iter().next() else {
            return Ok(SweepOutcome::NOTHING_DUE);
        };

        let repo = self
            .store
            .get_repository_by_id(info.repo_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("repository {} for trivy row vanished", info.repo_id)))?;
        let manifest = self.store.get_manifest(info.repo_id, &info.digest).await?;

        let started = Utc::now();
        let outcome = match manifest {
            None => TrivySecurityInfo {
                status: VulnStatus::Error,
                message: Some("manifest no longer exists".to_string()),
                checked_at: Some(now),
                check_duration: Some(chrono::Duration::zero()),
                next_check_at: now + self.recheck_interval,
                ..info
            },
            Some(manifest) => {
                match self
                    .scanner
                    .scan(repo.account_name.as_str(), repo.name.as_str(), &info.digest, &manifest.media_type)
                    .await
                {
                    Ok(report) => {
                        let status = if report.vulnerable { VulnStatus::Vulnerable } else { VulnStatus::Clean };
                        info!(account = repo.account_name.as_str(), repo = repo.name.as_str(), digest = info.digest.as_str(), ?status, "vulnerability scan completed");
                        TrivySecurityInfo {
                            status,
                            message: report.message,
                            checked_at: Some(now),
                            check_duration: Some(Utc::now() - started),
                            next_check_at: now + self.recheck_interval,
                            ..info
                        }
                    }
                    Err(err) => {
                        warn!(account = repo.account_name.as_str(), repo = repo.name.as_str(), digest = info.digest.as_str(), error = %err, "vulnerability scan failed");
                        TrivySecurityInfo {
                            status: VulnStatus::Error,
                            message: Some(err.to_string()),
                            checked_at: Some(now),
                            check_duration: Some(Utc::now() - started),
                            next_check_at: now + self.recheck_interval,
                            ..info
                        }
                    }
                }
            }
        };
        self.store.upsert_trivy_info(outcome).await?;
        Ok(SweepOutcome::one())
    }
}
