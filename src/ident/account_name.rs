use super::is_grammar_component;
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// An account name: `[a-z0-9]+([._-][a-z0-9]+)*`, 1-48 characters,
/// globally unique within a deployment (spec.md §4.1, §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountName(String);

impl AccountName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccountName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > 48 {
            return Err(Error::NameInvalid(format!(
                "account name must be 1-48 characters, got {}",
                s.len()
            )));
        }
        if !is_grammar_component(s) {
            return Err(Error::NameInvalid(format!(
                "account name {:?} does not match [a-z0-9]+([._-][a-z0-9]+)*",
                s
            )));
        }
        Ok(AccountName(s.to_string()))
    }
}

impl TryFrom<String> for AccountName {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AccountName> for String {
    fn from(a: AccountName) -> String {
        a.0
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!("acme".parse::<AccountName>().is_ok());
        assert!("acme-corp.prod_1".parse::<AccountName>().is_ok());
    }

    #[test]
    fn rejects_empty_and_oversized() {
        assert!("".parse::<AccountName>().is_err());
        let too_long = "a".repeat(49);
        assert!(too_long.parse::<AccountName>().is_err());
        assert!("a".repeat(48).parse::<AccountName>().is_ok());
    }

    #[test]
    fn rejects_bad_grammar() {
        assert!("Acme".parse::<AccountName>().is_err()); // uppercase
        assert!("-acme".parse::<AccountName>().is_err()); // leading separator
        assert!("acme-".parse::<AccountName>().is_err()); // trailing separator
        assert!("ac--me".parse::<AccountName>().is_err()); // doubled separator
        assert!("ac/me".parse::<AccountName>().is_err()); // no slashes
    }
}
