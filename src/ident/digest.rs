use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A content digest, `algo:hex` (spec.md §4.1). Only `sha256` is produced
/// by this engine, but parsing accepts any `algo` matching `[a-z0-9+._-]+`
/// so foreign digests (e.g. from an upstream using sha512) round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algo: String,
    hex: String,
}

impl Digest {
    pub fn new(algo: impl Into<String>, hex: impl Into<String>) -> Self {
        Self {
            algo: algo.into(),
            hex: hex.into(),
        }
    }

    pub fn algo(&self) -> &str {
        &self.algo
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Compute the sha256 digest of `bytes`.
    pub fn sha256(bytes: &[u8]) -> Self {
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            algo: "sha256".to_string(),
            hex: hex::encode(hasher.finalize()),
        }
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::DigestInvalid(format!("{:?} has no algo prefix", s)))?;
        if algo.is_empty() || !algo.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-')) {
            return Err(Error::DigestInvalid(format!("invalid digest algorithm {:?}", algo)));
        }
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::DigestInvalid(format!("invalid digest hex in {:?}", s)));
        }
        Ok(Digest {
            algo: algo.to_string(),
            hex: hex.to_lowercase(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sha256() {
        let d: Digest = "sha256:deadbeef".parse().unwrap();
        assert_eq!(d.algo(), "sha256");
        assert_eq!(d.hex(), "deadbeef");
        assert_eq!(d.to_string(), "sha256:deadbeef");
    }

    #[test]
    fn rejects_missing_colon() {
        assert!("deadbeef".parse::<Digest>().is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!("sha256:not-hex!".parse::<Digest>().is_err());
    }

    #[test]
    fn sha256_of_bytes_round_trips() {
        let d = Digest::sha256(b"hello world");
        let s = d.to_string();
        let parsed: Digest = s.parse().unwrap();
        assert_eq!(d, parsed);
    }
}
