//! Trivy security-scan status record (spec.md §3 TrivySecurityInfo,
//! §4.5 step 8, §4.8 vulnerability check).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Scan lifecycle status for one (repo, digest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnStatus {
    /// Queued at manifest ingest (spec.md §4.5 step 8), not yet scanned.
    Pending,
    Clean,
    Vulnerable,
    /// The scanner could not produce a report (timeout, unsupported
    /// media type, transient error).
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrivySecurityInfo {
    pub repo_id: i64,
    pub digest: String,
    pub status: VulnStatus,
    pub message: Option<String>,
    pub next_check_at: DateTime<Utc>,
    pub checked_at: Option<DateTime<Utc>>,
    pub check_duration: Option<Duration>,
}

impl TrivySecurityInfo {
    /// A freshly-queued row for a manifest just ingested (spec.md §4.5
    /// step 8: "Record TrivySecurityInfo(status=Pending, next_check_at=now)").
    pub fn queued(repo_id: i64, digest: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            repo_id,
            digest: digest.into(),
            status: VulnStatus::Pending,
            message: None,
            next_check_at: now,
            checked_at: None,
            check_duration: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_row_starts_pending() {
        let now = Utc::now();
        let info = TrivySecurityInfo::queued(1, "sha256:aaaa", now);
        assert_eq!(info.status, VulnStatus::Pending);
        assert_eq!(info.next_check_at, now);
        assert!(info.checked_at.is_none());
    }
}
