//! Environment-driven configuration
//!
//! Keppel takes its runtime configuration from the environment rather
//! than a config file, in the manner of `rune::registry::server::RegistryConfig`
//! and `rune::daemon::server::DaemonConfig`. Only the names named in
//! spec.md §6 are read here; none of these are validated against a
//! running driver, since the drivers themselves are out of scope.

use std::time::Duration;

/// Database connection parameters.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "keppel".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

/// Janitor sweep tuning knobs.
///
/// The pending-blob timeout and retry count are deliberately left
/// unspecified by spec.md §9 ("implementers must choose values with
/// operator-facing knobs") — see DESIGN.md for the chosen defaults.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Base interval between sweep passes for a given sweep kind.
    pub sweep_interval: Duration,
    /// Fraction of `sweep_interval` used as the bound for reschedule jitter.
    pub jitter_fraction: f64,
    /// How long a pending-blob replication lock may be held before it is
    /// considered abandoned and deleted.
    pub pending_blob_timeout: Duration,
    /// Maximum number of bounded-poll retries a waiter performs against a
    /// `PendingBlob` held by another worker before retrying from scratch.
    pub pending_blob_max_retries: u32,
    /// Grace period before an `UnknownBlob`/`UnknownManifest` tombstone
    /// becomes eligible for storage deletion.
    pub reconciliation_grace: Duration,
    /// Age after which a validated blob/manifest is re-sampled by the
    /// validation sweep.
    pub validation_age: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            jitter_fraction: 0.1,
            pending_blob_timeout: Duration::from_secs(30),
            pending_blob_max_retries: 5,
            reconciliation_grace: Duration::from_secs(6 * 3600),
            validation_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Top-level Keppel configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    /// Path to the ed25519 issuer private key (PEM), preferred over RSA.
    pub issuer_key_path: Option<String>,
    /// Public FQDN this deployment is reachable at for direct API calls.
    pub api_public_fqdn: String,
    /// Public FQDN used for anycast-forwarded requests between peers.
    pub anycast_fqdn: Option<String>,
    /// Optional Redis URL backing auth/ratelimit caches.
    pub redis_url: Option<String>,
    /// Optional vulnerability scanner URL.
    pub scanner_url: Option<String>,
    /// Optional preshared key for the vulnerability scanner.
    pub scanner_preshared_key: Option<String>,
    /// Optional audit log sink URL.
    pub audit_sink_url: Option<String>,
    /// Skip TLS verification on outbound peer/upstream calls. Debug only.
    pub insecure_tls: bool,
    /// Filesystem root for the local [`crate::storage::fs::FsStorageDriver`].
    pub storage_root: String,
    pub janitor: JanitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            issuer_key_path: None,
            api_public_fqdn: "keppel.localhost".to_string(),
            anycast_fqdn: None,
            redis_url: None,
            scanner_url: None,
            scanner_preshared_key: None,
            audit_sink_url: None,
            insecure_tls: false,
            storage_root: "/var/lib/keppel/storage".to_string(),
            janitor: JanitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("KEPPEL_DB_HOST") {
            cfg.database.host = v;
        }
        if let Ok(v) = std::env::var("KEPPEL_DB_PORT") {
            if let Ok(p) = v.parse() {
                cfg.database.port = p;
            }
        }
        if let Ok(v) = std::env::var("KEPPEL_DB_NAME") {
            cfg.database.name = v;
        }
        if let Ok(v) = std::env::var("KEPPEL_DB_USER") {
            cfg.database.user = v;
        }
        if let Ok(v) = std::env::var("KEPPEL_DB_PASSWORD") {
            cfg.database.password = v;
        }
        if let Ok(v) = std::env::var("KEPPEL_ISSUER_KEY") {
            cfg.issuer_key_path = Some(v);
        }
        if let Ok(v) = std::env::var("KEPPEL_API_PUBLIC_FQDN") {
            cfg.api_public_fqdn = v;
        }
        if let Ok(v) = std::env::var("KEPPEL_ANYCAST_FQDN") {
            cfg.anycast_fqdn = Some(v);
        }
        if let Ok(v) = std::env::var("KEPPEL_REDIS_URL") {
            cfg.redis_url = Some(v);
        }
        if let Ok(v) = std::env::var("KEPPEL_SCANNER_URL") {
            cfg.scanner_url = Some(v);
        }
        if let Ok(v) = std::env::var("KEPPEL_SCANNER_PRESHARED_KEY") {
            cfg.scanner_preshared_key = Some(v);
        }
        if let Ok(v) = std::env::var("KEPPEL_AUDIT_SINK_URL") {
            cfg.audit_sink_url = Some(v);
        }
        if let Ok(v) = std::env::var("KEPPEL_INSECURE_TLS") {
            cfg.insecure_tls = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("KEPPEL_STORAGE_ROOT") {
            cfg.storage_root = v;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_db_url() {
        let cfg = Config::default();
        assert!(cfg.database.url().starts_with("postgres://"));
    }

    #[test]
    fn janitor_defaults_give_operator_facing_knobs() {
        let j = JanitorConfig::default();
        assert!(j.pending_blob_timeout.as_secs() > 0);
        assert!(j.pending_blob_max_retries > 0);
    }
}
