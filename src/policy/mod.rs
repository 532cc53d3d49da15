//! Policy kernel (spec.md §4.2)
//!
//! Pure evaluators for the five policy kinds: GC, RBAC, tag, manifest
//! validation, and security-scan. These functions take their inputs as
//! plain values and make a yes/no (or action) decision; none of them
//! touch the store or the network.

pub mod gc;
pub mod rbac;
pub mod security_scan;
pub mod sublease;
pub mod tag;
pub mod validation;

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The match rule shared by GC and tag policies (spec.md §4.2):
/// a repository regex with an optional negative override, and an
/// optional tag regex with an optional negative override, evaluated
/// against the full set of tags a manifest currently carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRule {
    #[serde(rename = "match_repository")]
    pub repository: String,
    #[serde(rename = "except_repository", skip_serializing_if = "Option::is_none")]
    pub negative_repository: Option<String>,
    #[serde(rename = "match_tag", skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "except_tag", skip_serializing_if = "Option::is_none")]
    pub negative_tag: Option<String>,
}

impl MatchRule {
    /// Validate the rule's regexes compile and that the repository regex
    /// is non-empty (spec.md: "Empty repository-regex is invalid").
    pub fn validate(&self) -> Result<()> {
        if self.repository.is_empty() {
            return Err(Error::PolicyInvalid(
                "match_repository must not be empty".into(),
            ));
        }
        Regex::new(&self.repository)
            .map_err(|e| Error::PolicyInvalid(format!("invalid match_repository regex: {e}")))?;
        if let Some(ref r) = self.negative_repository {
            Regex::new(r)
                .map_err(|e| Error::PolicyInvalid(format!("invalid except_repository regex: {e}")))?;
        }
        if let Some(ref r) = self.tag {
            Regex::new(r).map_err(|e| Error::PolicyInvalid(format!("invalid match_tag regex: {e}")))?;
        }
        if let Some(ref r) = self.negative_tag {
            Regex::new(r).map_err(|e| Error::PolicyInvalid(format!("invalid except_tag regex: {e}")))?;
        }
        Ok(())
    }

    /// Whether this rule applies to `repo_name` at all.
    pub fn matches_repository(&self, repo_name: &str) -> bool {
        if let Some(ref neg) = self.negative_repository {
            if Regex::new(neg).map(|r| r.is_match(repo_name)).unwrap_or(false) {
                return false;
            }
        }
        Regex::new(&self.repository)
            .map(|r| r.is_match(repo_name))
            .unwrap_or(false)
    }

    /// Whether this rule applies given the manifest's full tag set.
    /// Negative tag regex matching any tag rejects outright; an unset
    /// positive tag regex accepts; otherwise accept iff at least one tag
    /// matches the positive regex.
    pub fn matches_tags(&self, tags: &[String]) -> bool {
        if let Some(ref neg) = self.negative_tag {
            if let Ok(neg_re) = Regex::new(neg) {
                if tags.iter().any(|t| neg_re.is_match(t)) {
                    return false;
                }
            }
        }
        match &self.tag {
            None => true,
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => tags.iter().any(|t| re.is_match(t)),
                Err(_) => false,
            },
        }
    }

    /// Combined match: repository AND tag set.
    pub fn matches(&self, repo_name: &str, tags: &[String]) -> bool {
        self.matches_repository(repo_name) && self.matches_tags(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(repo: &str, neg_repo: Option<&str>, tag: Option<&str>, neg_tag: Option<&str>) -> MatchRule {
        MatchRule {
            repository: repo.to_string(),
            negative_repository: neg_repo.map(String::from),
            tag: tag.map(String::from),
            negative_tag: neg_tag.map(String::from),
        }
    }

    #[test]
    fn empty_repository_regex_is_invalid() {
        assert!(rule("", None, None, None).validate().is_err());
    }

    #[test]
    fn negative_repository_takes_precedence() {
        let r = rule(".*", Some("^secret/"), None, None);
        assert!(!r.matches_repository("secret/app"));
        assert!(r.matches_repository("public/app"));
    }

    #[test]
    fn unset_positive_tag_accepts() {
        let r = rule(".*", None, None, None);
        assert!(r.matches_tags(&["v1".into()]));
        assert!(r.matches_tags(&[]));
    }

    #[test]
    fn negative_tag_rejects_if_any_tag_matches() {
        let r = rule(".*", None, None, Some("^pin-"));
        assert!(!r.matches_tags(&["pin-1".into(), "v2".into()]));
        assert!(r.matches_tags(&["v2".into()]));
    }

    #[test]
    fn positive_tag_requires_at_least_one_match() {
        let r = rule(".*", None, Some("^pr-"), None);
        assert!(r.matches_tags(&["pr-42".into()]));
        assert!(!r.matches_tags(&["v1".into()]));
        assert!(!r.matches_tags(&[]));
    }
}
