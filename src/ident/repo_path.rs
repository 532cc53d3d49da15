use super::is_grammar_component;
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A repository path: `/`-joined sequence of grammar components
/// (spec.md §4.1, §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoPath(String);

impl RepoPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl FromStr for RepoPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::NameInvalid("repository path must not be empty".into()));
        }
        for component in s.split('/') {
            if !is_grammar_component(component) {
                return Err(Error::NameInvalid(format!(
                    "repository path {:?} has invalid component {:?}",
                    s, component
                )));
            }
        }
        Ok(RepoPath(s.to_string()))
    }
}

impl TryFrom<String> for RepoPath {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RepoPath> for String {
    fn from(r: RepoPath) -> String {
        r.0
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
