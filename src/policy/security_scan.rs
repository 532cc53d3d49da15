//! Security-scan policy (spec.md §4.2, §4.8 vuln_check sweep)
//!
//! Governs how a vulnerability reported by the scanner for a given
//! repository is treated: ignored outright, or downgraded/upgraded to
//! a fixed severity with a human assessment recorded alongside it.
//! Matching is first-match-wins in declaration order.

use super::MatchRule;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

const MAX_ASSESSMENT_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ScanAction {
    Ignore,
    Severity { severity: Severity, assessment: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityScanPolicy {
    #[serde(flatten)]
    pub rule: MatchRule,
    pub match_vulnerability_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub except_vulnerability_id: Option<String>,
    pub except_fix_released: bool,
    #[serde(flatten)]
    pub action: ScanAction,
}

impl SecurityScanPolicy {
    pub fn validate(&self) -> Result<()> {
        self.rule.validate()?;
        regex::Regex::new(&self.match_vulnerability_id)
            .map_err(|e| Error::PolicyInvalid(format!("invalid match_vulnerability_id: {e}")))?;
        if let Some(ref r) = self.except_vulnerability_id {
            regex::Regex::new(r)
                .map_err(|e| Error::PolicyInvalid(format!("invalid except_vulnerability_id: {e}")))?;
        }
        if let ScanAction::Severity { assessment, .. } = &self.action {
            if assessment.len() > MAX_ASSESSMENT_BYTES {
                return Err(Error::PolicyInvalid(format!(
                    "assessment must be at most {MAX_ASSESSMENT_BYTES} bytes"
                )));
            }
        }
        Ok(())
    }

    fn matches_vulnerability(&self, repo_name: &str, tags: &[String], vulnerability_id: &str) -> bool {
        if !self.rule.matches(repo_name, tags) {
            return false;
        }
        if let Some(ref except) = self.except_vulnerability_id {
            if regex::Regex::new(except)
                .map(|r| r.is_match(vulnerability_id))
                .unwrap_or(false)
            {
                return false;
            }
        }
        regex::Regex::new(&self.match_vulnerability_id)
            .map(|r| r.is_match(vulnerability_id))
            .unwrap_or(false)
    }
}

/// One vulnerability entry from a scan report, as needed to apply
/// policy (spec.md §4.2: `except_fix_released`).
pub struct VulnerabilityFacts<'a> {
    pub id: &'a str,
    pub fix_released: bool,
}

/// First matching policy's action, or `None` if no policy applies (the
/// vulnerability passes through unmodified).
pub fn applicable_action<'a>(
    policies: &'a [SecurityScanPolicy],
    repo_name: &str,
    tags: &[String],
    vuln: &VulnerabilityFacts<'_>,
) -> Option<&'a SecurityScanPolicy> {
    policies.iter().find(|p| {
        if p.except_fix_released && vuln.fix_released {
            return false;
        }
        p.matches_vulnerability(repo_name, tags, vuln.id)
    })
}

/// Rewrites a Trivy JSON report by appending an
/// `X-Keppel-Applicable-Policies` object mapping each vulnerability id
/// it affected to the policy that matched. Non-JSON reports (or JSON
/// without the expected shape) pass through unchanged.
pub fn enrich_trivy_report(
    report: &[u8],
    policies: &[SecurityScanPolicy],
    repo_name: &str,
    tags: &[String],
) -> Vec<u8> {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value> (report) else {
        return report.to_vec();
    };
    let Some(results) = value.get("Results").and_then(|r| r.as_array()).cloned() else {
        return report.to_vec();
    };

    let mut applicable = serde_json::Map::new();
    for result in &results {
        let Some(vulns) = result.get("Vulnerabilities").and_then(|v| v.as_array()) else {
            continue;
        };
        for v in vulns {
            let Some(id) = v.get("VulnerabilityID").and_then(|i| i.as_str()) else {
                continue;
            };
            let fix_released = v
                .get("FixedVersion")
                .and_then(|f| f.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            let facts = VulnerabilityFacts { id, fix_released };
            if let Some(policy) = applicable_action(policies, repo_name, tags, &facts) {
                if let Ok(policy_json) = serde_json::to_value(policy) {
                    applicable.insert(id.to_string(), policy_json);
                }
            }
        }
    }

    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "X-Keppel-Applicable-Policies".to_string(),
            serde_json::Value::Object(applicable),
        );
    }
    serde_json::to_vec(&value).unwrap_or_else(|_| report.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(repo: &str) -> MatchRule {
        MatchRule {
            repository: repo.to_string(),
            negative_repository: None,
            tag: None,
            negative_tag: None,
        }
    }

    fn ignore_policy(repo: &str, vuln: &str) -> SecurityScanPolicy {
        SecurityScanPolicy {
            rule: rule(repo),
            match_vulnerability_id: vuln.to_string(),
            except_vulnerability_id: None,
            except_fix_released: false,
            action: ScanAction::Ignore,
        }
    }

    #[test]
    fn assessment_too_long_rejected() {
        let mut p = ignore_policy(".*", ".*");
        p.action = ScanAction::Severity {
            severity: Severity::High,
            assessment: "x".repeat(MAX_ASSESSMENT_BYTES + 1),
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn except_fix_released_skips_fixed_vulnerabilities() {
        let mut p = ignore_policy(".*", ".*");
        p.except_fix_released = true;
        let policies = vec![p];
        let fixed = VulnerabilityFacts { id: "CVE-1", fix_released: true };
        let unfixed = VulnerabilityFacts { id: "CVE-1", fix_released: false };
        assert!(applicable_action(&policies, "acct/repo", &[], &fixed).is_none());
        assert!(applicable_action(&policies, "acct/repo", &[], &unfixed).is_some());
    }

    #[test]
    fn first_match_wins() {
        let first = ignore_policy(".*", "^CVE-1$");
        let mut second = ignore_policy(".*", ".*");
        second.action = ScanAction::Severity {
            severity: Severity::Critical,
            assessment: "escalated".to_string(),
        };
        let policies = vec![first, second];
        let vuln = VulnerabilityFacts { id: "CVE-1", fix_released: false };
        let matched = applicable_action(&policies, "acct/repo", &[], &vuln).unwrap();
        assert!(matches!(matched.action, ScanAction::Ignore));
    }

    #[test]
    fn enrich_non_json_passes_through() {
        let raw = b"not json at all";
        let out = enrich_trivy_report(raw, &[], "acct/repo", &[]);
        assert_eq!(out, raw);
    }

    #[test]
    fn enrich_adds_applicable_policies_key() {
        let report = serde_json::json!({
            "Results": [{
                "Vulnerabilities": [{"VulnerabilityID": "CVE-2", "FixedVersion": ""}]
            }]
        });
        let policies = vec![ignore_policy(".*", "^CVE-2$")];
        let out = enrich_trivy_report(report.to_string().as_bytes(), &policies, "acct/repo", &[]);
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(value.get("X-Keppel-Applicable-Policies").unwrap().get("CVE-2").is_some());
    }
}
