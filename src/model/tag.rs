//! Tag record (spec.md §3 Tag).

use crate::ident::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A mutable named pointer within a repository to one manifest digest
/// (spec.md §3 Tag). **Invariant I3**: the referenced manifest must
/// exist in the same repo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub repo_id: i64,
    pub name: String,
    pub digest: Digest,
    pub pushed_at: DateTime<Utc>,
    pub last_pulled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_carries_digest_reference() {
        let tag = Tag {
            repo_id: 1,
            name: "latest".to_string(),
            digest: Digest::sha256(b"content"),
            pushed_at: Utc::now(),
            last_pulled_at: None,
        };
        assert_eq!(tag.name, "latest");
    }
}
