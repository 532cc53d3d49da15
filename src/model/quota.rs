//! Quota record (spec.md §3 Quota, §4.5 step 6).

use serde::{Deserialize, Serialize};

/// Manifest-count limit for an auth tenant. Usage is computed by
/// counting manifests across all repos in all accounts sharing the
/// tenant (spec.md §3 Quota).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub auth_tenant_id: String,
    pub manifest_count_limit: i64,
}

impl Quota {
    /// Whether pushing one more manifest keeps usage within the limit
    /// (spec.md §4.5 step 6: "current manifest-count + 1 ≤ limit").
    pub fn allows_one_more(&self, current_manifest_count: i64) -> bool {
        current_manifest_count + 1 <= self.manifest_count_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_push_under_limit() {
        let q = Quota {
            auth_tenant_id: "tenant-a".to_string(),
            manifest_count_limit: 1,
        };
        assert!(q.allows_one_more(0));
        assert!(!q.allows_one_more(1));
    }
}
