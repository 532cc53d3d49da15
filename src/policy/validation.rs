//! Manifest validation policy (spec.md §4.2, §4.5 step 4)
//!
//! A validation rule is a CEL expression evaluated against a manifest's
//! labels and layer metadata at ingest time; the push is rejected if
//! the expression evaluates to anything but `true`. Compiled programs
//! are cached because the same rule text runs on every manifest push
//! that matches its repository regex.

use super::MatchRule;
use crate::error::{Error, Result};
use cel_interpreter::{Context, Program, Value as CelValue};
use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::OnceLock;

const PROGRAM_CACHE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicy {
    #[serde(flatten)]
    pub rule: MatchRule,
    /// CEL expression over `labels`, `layers`, `media_type`, `repo_name`.
    pub expression: String,
}

impl ValidationPolicy {
    pub fn validate(&self) -> Result<()> {
        self.rule.validate()?;
        if self.expression.trim().is_empty() {
            return Err(Error::PolicyInvalid("validation expression must not be empty".into()));
        }
        Program::compile(&self.expression)
            .map_err(|e| Error::PolicyInvalid(format!("invalid CEL expression: {e}")))?;
        Ok(())
    }
}

/// Facts about a manifest exposed to the CEL expression.
#[derive(Debug, Clone)]
pub struct ManifestFacts {
    pub labels: BTreeMap<String, String>,
    pub layers: Vec<BTreeMap<String, serde_json::Value>>,
    pub media_type: String,
    pub repo_name: String,
}

fn legacy_shape_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^'([^']+)' in labels$").expect("static regex"))
}

/// If `expression` is exactly the legacy `'L1' in labels && 'L2' in
/// labels && …` shape, return the extracted label list in order
/// (spec.md §4.2 backward-compatibility note).
pub fn legacy_required_labels(expression: &str) -> Option<Vec<String>> {
    let mut labels = Vec::new();
    for clause in expression.split("&&") {
        let clause = clause.trim();
        let caps = legacy_shape_regex().captures(clause)?;
        labels.push(caps[1].to_string());
    }
    if labels.is_empty() {
        None
    } else {
        Some(labels)
    }
}

pub struct ProgramCache {
    inner: Mutex<LruCache<String, Program>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(PROGRAM_CACHE_CAPACITY).unwrap())),
        }
    }

    fn get_or_compile(&self, expression: &str) -> Result<Program> {
        let mut cache = self.inner.lock().expect("validation program cache poisoned");
        if let Some(program) = cache.get(expression) {
            return Ok(program.clone());
        }
        let program = Program::compile(expression)
            .map_err(|e| Error::PolicyInvalid(format!("invalid CEL expression: {e}")))?;
        cache.put(expression.to_string(), program.clone());
        Ok(program)
    }
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

fn json_to_cel(value: &serde_json::Value) -> CelValue {
    match value {
        serde_json::Value::Null => CelValue::Null,
        serde_json::Value::Bool(b) => CelValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else {
                CelValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => CelValue::String(s.clone().into()),
        serde_json::Value::Array(items) => {
            CelValue::List(items.iter().map(json_to_cel).collect::<Vec<_>>().into())
        }
        serde_json::Value::Object(map) => {
            let mut out = std::collections::HashMap::new();
            for (k, v) in map {
                out.insert(k.clone().into(), json_to_cel(v));
            }
            CelValue::Map(out.into())
        }
    }
}

fn bind_facts(context: &mut Context<'_>, facts: &ManifestFacts) -> Result<()> {
    let labels: BTreeMap<String, serde_json::Value> = facts
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    let layers: Vec<serde_json::Value> = facts
        .layers
        .iter()
        .map(|l| serde_json::to_value(l).unwrap_or(serde_json::Value::Null))
        .collect();

    context
        .add_variable("labels", json_to_cel(&serde_json::to_value(&labels).map_err(Error::Json)?))
        .map_err(|e| Error::Internal(format!("failed to bind labels: {e}")))?;
    context
        .add_variable("layers", json_to_cel(&serde_json::Value::Array(layers)))
        .map_err(|e| Error::Internal(format!("failed to bind layers: {e}")))?;
    context
        .add_variable("media_type", CelValue::String(facts.media_type.clone().into()))
        .map_err(|e| Error::Internal(format!("failed to bind media_type: {e}")))?;
    context
        .add_variable("repo_name", CelValue::String(facts.repo_name.clone().into()))
        .map_err(|e| Error::Internal(format!("failed to bind repo_name: {e}")))?;
    Ok(())
}

/// Evaluate every validation policy matching `tags`; the push is
/// rejected if any matching rule's expression evaluates to anything but
/// `true`. A non-boolean result or evaluation error is treated as a
/// rejection (fail closed): a rule that cannot be evaluated cannot be
/// said to have passed.
pub fn evaluate(
    cache: &ProgramCache,
    policies: &[ValidationPolicy],
    tags: &[String],
    facts: &ManifestFacts,
) -> Result<()> {
    for policy in policies {
        if !policy.rule.matches(&facts.repo_name, tags) {
            continue;
        }
        let program = cache.get_or_compile(&policy.expression)?;
        let mut context = Context::default();
        bind_facts(&mut context, facts)?;
        let result = program
            .execute(&context)
            .map_err(|e| Error::ManifestInvalid(format!("validation rule errored: {e}")))?;
        match result {
            CelValue::Bool(true) => {}
            _ => {
                return Err(Error::ManifestInvalid(format!(
                    "manifest rejected by validation rule: {}",
                    policy.expression
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(labels: &[(&str, &str)]) -> ManifestFacts {
        ManifestFacts {
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            layers: vec![],
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            repo_name: "acct/repo".to_string(),
        }
    }

    fn policy(expr: &str) -> ValidationPolicy {
        ValidationPolicy {
            rule: MatchRule {
                repository: ".*".to_string(),
                negative_repository: None,
                tag: None,
                negative_tag: None,
            },
            expression: expr.to_string(),
        }
    }

    #[test]
    fn invalid_cel_expression_rejected_at_validate() {
        let p = policy("this is not ( valid cel");
        assert!(p.validate().is_err());
    }

    #[test]
    fn empty_expression_invalid() {
        let p = policy("   ");
        assert!(p.validate().is_err());
    }

    #[test]
    fn label_present_allows_manifest() {
        let cache = ProgramCache::new();
        let policies = vec![policy("'org.opencontainers.image.source' in labels")];
        let f = facts(&[("org.opencontainers.image.source", "https://example.org")]);
        assert!(evaluate(&cache, &policies, &[], &f).is_ok());
    }

    #[test]
    fn missing_label_rejects_manifest() {
        let cache = ProgramCache::new();
        let policies = vec![policy("'org.opencontainers.image.source' in labels")];
        let f = facts(&[]);
        assert!(evaluate(&cache, &policies, &[], &f).is_err());
    }

    #[test]
    fn legacy_shape_extracts_labels_in_order() {
        let expr = "'L1' in labels && 'L2' in labels && 'L3' in labels";
        let labels = legacy_required_labels(expr).unwrap();
        assert_eq!(labels, vec!["L1".to_string(), "L2".to_string(), "L3".to_string()]);
    }

    #[test]
    fn non_legacy_shape_returns_none() {
        assert!(legacy_required_labels("labels.size() > 2").is_none());
    }
}
