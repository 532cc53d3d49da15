//! Tag policy evaluation (spec.md §4.2, §4.5)

use super::MatchRule;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// What a tag policy blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagAction {
    /// Blocks pushing a new manifest under a matching tag.
    BlockPush,
    /// Blocks overwriting an existing tag with a new digest.
    BlockOverwrite,
    /// Blocks deleting a matching tag.
    BlockDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPolicy {
    #[serde(flatten)]
    pub rule: MatchRule,
    pub action: TagAction,
}

impl TagPolicy {
    pub fn validate(&self) -> Result<()> {
        self.rule.validate()
    }
}

/// Whether pushing/overwriting a manifest under `tag` within `repo_name`,
/// given the manifest's resulting tag set, is blocked by any `block_push`
/// or `block_overwrite` policy (spec.md §4.5 step 5).
pub fn blocks_push(policies: &[TagPolicy], repo_name: &str, effective_tags: &[String]) -> bool {
    policies.iter().any(|p| {
        matches!(p.action, TagAction::BlockPush | TagAction::BlockOverwrite)
            && p.rule.matches(repo_name, effective_tags)
    })
}

/// Whether deleting `tag` within `repo_name` is blocked by a `block_delete`
/// policy.
pub fn blocks_delete(policies: &[TagPolicy], repo_name: &str, tag: &str) -> bool {
    let tags = [tag.to_string()];
    policies.iter().any(|p| {
        matches!(p.action, TagAction::BlockDelete) && p.rule.matches(repo_name, &tags)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(repo: &str, tag: &str, action: TagAction) -> TagPolicy {
        TagPolicy {
            rule: MatchRule {
                repository: repo.to_string(),
                negative_repository: None,
                tag: Some(tag.to_string()),
                negative_tag: None,
            },
            action,
        }
    }

    #[test]
    fn block_push_denies_matching_tag() {
        let policies = vec![policy(".*", "^prod-.*", TagAction::BlockPush)];
        assert!(blocks_push(&policies, "acct/repo", &["prod-1".into()]));
        assert!(!blocks_push(&policies, "acct/repo", &["dev-1".into()]));
    }

    #[test]
    fn block_delete_only_applies_to_delete_checks() {
        let policies = vec![policy(".*", "^pinned$", TagAction::BlockDelete)];
        assert!(blocks_delete(&policies, "acct/repo", "pinned"));
        assert!(!blocks_push(&policies, "acct/repo", &["pinned".into()]));
    }
}
