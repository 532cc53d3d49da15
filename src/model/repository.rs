//! Repository record (spec.md §3 Repository).

use crate::ident::{AccountName, RepoPath};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository within an account: auto-vivified on first write,
/// destroyed by cascade when the account is deleted (spec.md §3
/// Repository).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub account_name: AccountName,
    pub name: RepoPath,
    pub next_blob_mount_sweep_at: DateTime<Utc>,
    pub next_manifest_sync_at: DateTime<Utc>,
    pub next_gc_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_carries_account_and_path() {
        let repo = Repository {
            id: 1,
            account_name: "acct".parse().unwrap(),
            name: "library/nginx".parse().unwrap(),
            next_blob_mount_sweep_at: Utc::now(),
            next_manifest_sync_at: Utc::now(),
            next_gc_at: Utc::now(),
        };
        assert_eq!(repo.name.as_str(), "library/nginx");
    }
}
