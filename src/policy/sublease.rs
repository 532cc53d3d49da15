//! Sublease token codec (spec.md §4.2, §6, §9 GLOSSARY)
//!
//! A signed handover blob that lets a second Keppel deployment take over
//! ownership of an account name from a first: `base64(JSON{account,
//! primary hostname, secret})`, passed out-of-band by the operator.

use crate::error::{Error, Result};
use crate::ident::AccountName;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubleaseToken {
    pub account: AccountName,
    pub primary_hostname: String,
    pub secret: String,
}

impl SubleaseToken {
    pub fn new(account: AccountName, primary_hostname: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            account,
            primary_hostname: primary_hostname.into(),
            secret: secret.into(),
        }
    }

    /// Encode as the opaque token string handed to the operator.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(Error::Json)?;
        Ok(BASE64.encode(json))
    }

    /// Decode a token string presented by a deployment claiming an account.
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(token)
            .map_err(|e| Error::UploadInvalid(format!("invalid sublease token encoding: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::UploadInvalid(format!("invalid sublease token contents: {e}")))
    }

    /// Whether this token authorizes claiming `account`, given the secret
    /// the claiming deployment received out-of-band.
    pub fn authorizes(&self, account: &AccountName, secret: &str) -> bool {
        &self.account == account && self.secret == secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let account: AccountName = "myaccount".parse().unwrap();
        let token = SubleaseToken::new(account.clone(), "registry-a.example.org", "s3cr3t");
        let encoded = token.encode().unwrap();
        let decoded = SubleaseToken::decode(&encoded).unwrap();
        assert_eq!(token, decoded);
        assert!(decoded.authorizes(&account, "s3cr3t"));
        assert!(!decoded.authorizes(&account, "wrong"));
    }

    #[test]
    fn garbage_token_rejected() {
        assert!(SubleaseToken::decode("not valid base64!!!").is_err());
    }
}
