//! Vulnerability scanner client (spec.md §4.8 vulnerability check)
//!
//! `ScannerClient` is the seam to an external Trivy-compatible scanner.
//! The janitor's `vuln_check` sweep calls it once per due manifest and
//! persists whatever comes back through `Store::upsert_trivy_info`.

use crate::error::{Error, Result};
use async_trait::async_trait;

/// Outcome of scanning one manifest.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub vulnerable: bool,
    pub message: Option<String>,
}

#[async_trait]
pub trait ScannerClient: Send + Sync {
    async fn scan(&self, account: &str, repo_name: &str, digest: &str, media_type: &str) -> Result<ScanReport>;
}

/// Always reports clean. Used when no `KEPPEL_SCANNER_URL` is configured
/// (spec.md §6): vulnerability scanning is ambient infrastructure, not a
/// hard dependency of the ingest/janitor engines.
pub struct NoopScanner;

#[async_trait]
impl ScannerClient for NoopScanner {
    async fn scan(&self, _account: &str, _repo_name: &str, _digest: &str, _media_type: &str) -> Result<ScanReport> {
        Ok(ScanReport { vulnerable: false, message: None })
    }
}

#[derive(serde::Deserialize)]
struct ScanResponseWire {
    vulnerable: bool,
    message: Option<String>,
}

/// HTTP client for a Trivy-server-compatible scanner.
pub struct HttpScanner {
    http: reqwest::Client,
    base_url: String,
    preshared_key: Option<String>,
}

impl HttpScanner {
    pub fn new(base_url: impl Into<String>, preshared_key: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into(), preshared_key }
    }
}

#[async_trait]
impl ScannerClient for HttpScanner {
    async fn scan(&self, account: &str, repo_name: &str, digest: &str, media_type: &str) -> Result<ScanReport> {
        let mut request = self.http.post(format!("{}/scan", self.base_url)).json(&serde_json::json!({
            "account": account,
            "repository": repo_name,
            "digest": digest,
            "media_type": media_type,
        }));
        if let Some(key) = &self.preshared_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| Error::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!("scanner returned {}", response.status())));
        }
        let body: ScanResponseWire = response.json().await.map_err(|e| Error::Upstream(e.to_string()))?;
        Ok(ScanReport { vulnerable: body.vulnerable, message: body.message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_scanner_always_reports_clean() {
        let report = NoopScanner.scan("acct", "library/nginx", "sha256:aaaa", "application/vnd.oci.image.manifest.v1+json").await.unwrap();
        assert!(!report.vulnerable);
    }
}
