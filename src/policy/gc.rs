//! GC policy evaluation (spec.md §4.2, §4.8)

use super::MatchRule;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Action a GC policy applies to a matching manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcAction {
    Protect,
    Delete,
    DeleteIfUntagged,
    DeleteIfNoChildren,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcPolicy {
    #[serde(flatten)]
    pub rule: MatchRule,
    pub action: GcAction,
}

impl GcPolicy {
    pub fn validate(&self) -> Result<()> {
        self.rule.validate()
    }
}

/// Input facts about one manifest the GC sweep is deciding on.
pub struct GcManifestFacts<'a> {
    pub repo_name: &'a str,
    pub tags: &'a [String],
    pub pushed_at: DateTime<Utc>,
    pub is_referenced_by_parent: bool,
    pub has_children: bool,
}

/// What the GC sweep should do with a manifest, per spec.md §4.8: the
/// first policy (in declaration order) whose match rule applies wins;
/// with no match, the manifest is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcDecision {
    Keep,
    Delete,
}

/// Evaluate an ordered list of GC policies against one manifest's facts.
/// Tie-break: first matching policy wins (spec.md §4.8).
///
/// `DeleteIfUntagged` only ever fires once a manifest's tag set is
/// already empty, so re-running the rule's positive `match_tag` regex
/// against `facts.tags` would always fail (an empty slice matches no
/// regex) and the action could never trigger. That policy therefore
/// matches on repository alone; its `match_tag`/`except_tag` fields (if
/// set) describe which now-untagged manifests the operator intended to
/// sweep, not a predicate re-checked against the current tag set.
pub fn evaluate(policies: &[GcPolicy], facts: &GcManifestFacts<'_>) -> GcDecision {
    for policy in policies {
        let matches = match policy.action {
            GcAction::DeleteIfUntagged => policy.rule.matches_repository(facts.repo_name),
            _ => policy.rule.matches(facts.repo_name, facts.tags),
        };
        if !matches {
            continue;
        }
        return match policy.action {
            GcAction::Protect => GcDecision::Keep,
            GcAction::Delete => {
                if facts.is_referenced_by_parent {
                    GcDecision::Keep
                } else {
                    GcDecision::Delete
                }
            }
            GcAction::DeleteIfUntagged => {
                if facts.tags.is_empty() && !facts.is_referenced_by_parent {
                    GcDecision::Delete
                } else {
                    GcDecision::Keep
                }
            }
            GcAction::DeleteIfNoChildren => {
                if !facts.has_children && !facts.is_referenced_by_parent {
                    GcDecision::Delete
                } else {
                    GcDecision::Keep
                }
            }
        };
    }
    GcDecision::Keep
}
