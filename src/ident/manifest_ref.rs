use super::Digest;
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A manifest reference: either a digest or a tag (spec.md §4.1).
/// Disambiguated by whether the string parses as `algo:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ManifestRef {
    Digest(Digest),
    Tag(String),
}

impl ManifestRef {
    pub fn as_digest(&self) -> Option<&Digest> {
        match self {
            ManifestRef::Digest(d) => Some(d),
            ManifestRef::Tag(_) => None,
        }
    }

    pub fn as_tag(&self) -> Option<&str> {
        match self {
            ManifestRef::Tag(t) => Some(t),
            ManifestRef::Digest(_) => None,
        }
    }
}

/// Tag names: up to 128 characters of `[A-Za-z0-9_][A-Za-z0-9._-]*`,
/// the grammar used by both Docker Hub and the OCI distribution spec.
pub fn validate_tag_name(s: &str) -> Result<()> {
    if s.is_empty() || s.len() > 128 {
        return Err(Error::TagInvalid(format!(
            "tag must be 1-128 characters, got {}",
            s.len()
        )));
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return Err(Error::TagInvalid(format!(
            "tag {:?} must start with a letter, digit, or underscore",
            s
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(Error::TagInvalid(format!(
            "tag {:?} contains invalid characters",
            s
        )));
    }
    Ok(())
}

impl FromStr for ManifestRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(d) = s.parse::<Digest>() {
            return Ok(ManifestRef::Digest(d));
        }
        validate_tag_name(s)?;
        Ok(ManifestRef::Tag(s.to_string()))
    }
}

impl fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestRef::Digest(d) => write!(f, "{}", d),
            ManifestRef::Tag(t) => write!(f, "{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_shaped_strings_parse_as_digest() {
        let r: ManifestRef = "sha256:abcd1234".parse().unwrap();
        assert!(matches!(r, ManifestRef::Digest(_)));
    }

    #[test]
    fn other_strings_parse_as_tag() {
        let r: ManifestRef = "latest".parse().unwrap();
        assert_eq!(r.as_tag(), Some("latest"));
    }

    #[test]
    fn rejects_invalid_tag() {
        assert!("-bad".parse::<ManifestRef>().is_err());
        assert!("".parse::<ManifestRef>().is_err());
    }
}
