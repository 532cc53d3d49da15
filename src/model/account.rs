//! Account record (spec.md §3 Account, §4.2, §6 Account JSON)

use crate::policy::gc::GcPolicy;
use crate::policy::rbac::RbacPolicy;
use crate::policy::security_scan::SecurityScanPolicy;
use crate::policy::tag::TagPolicy;
use crate::ident::AccountName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `{os, arch, variant}` predicate in a platform filter (spec.md §3,
/// §4.6). A manifest-index member matches if it matches every predicate
/// present (missing fields on the predicate are wildcards).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl PlatformFilter {
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        if let Some(ref want) = self.os {
            if want != os {
                return false;
            }
        }
        if let Some(ref want) = self.architecture {
            if want != architecture {
                return false;
            }
        }
        if let Some(ref want) = self.variant {
            if Some(want.as_str()) != variant {
                return false;
            }
        }
        true
    }
}

/// An account's replication configuration (spec.md §3, §6). Serializes
/// to the wire shape `{strategy, upstream}` where `upstream` is a bare
/// hostname string for `on_first_use` and an `{url, username, password?}`
/// object for `from_external_on_first_use` (spec.md §6 Account JSON) —
/// a derived `tag`/`content` representation would wrap the hostname in
/// `{"upstream_peer_hostname": …}` instead, so this is hand-rolled.
#[derive(Debug, Clone)]
pub enum ReplicationStrategy {
    /// Not a replica: accepts direct pushes.
    None,
    /// Lazily pulled from a named peer deployment on first use.
    OnFirstUse { upstream_peer_hostname: String },
    /// Lazily pulled from an arbitrary external registry on first use.
    FromExternalOnFirstUse {
        url: String,
        username: String,
        password: Option<String>,
    },
}

#[derive(Serialize, Deserialize)]
struct ExternalUpstream {
    url: String,
    username: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    password: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Upstream {
    Hostname(String),
    External(ExternalUpstream),
}

#[derive(Serialize, Deserialize)]
struct ReplicationWire {
    strategy: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    upstream: Option<Upstream>,
}

impl Serialize for ReplicationStrategy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let wire = match self {
            ReplicationStrategy::None => ReplicationWire { strategy: "none".to_string(), upstream: None },
            ReplicationStrategy::OnFirstUse { upstream_peer_hostname } => ReplicationWire {
                strategy: "on_first_use".to_string(),
                upstream: Some(Upstream::Hostname(upstream_peer_hostname.clone())),
            },
            ReplicationStrategy::FromExternalOnFirstUse { url, username, password } => ReplicationWire {
                strategy: "from_external_on_first_use".to_string(),
                upstream: Some(Upstream::External(ExternalUpstream {
                    url: url.clone(),
                    username: username.clone(),
                    password: password.clone(),
                })),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReplicationStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = ReplicationWire::deserialize(deserializer)?;
        match (wire.strategy.as_str(), wire.upstream) {
            ("none", _) => Ok(ReplicationStrategy::None),
            ("on_first_use", Some(Upstream::Hostname(h))) => {
                Ok(ReplicationStrategy::OnFirstUse { upstream_peer_hostname: h })
            }
            ("from_external_on_first_use", Some(Upstream::External(e))) => {
                Ok(ReplicationStrategy::FromExternalOnFirstUse { url: e.url, username: e.username, password: e.password })
            }
            (other, _) => Err(serde::de::Error::custom(format!("unknown replication strategy {other:?}"))),
        }
    }
}

impl ReplicationStrategy {
    /// Whether this account is a replica of something (spec.md I5: replica
    /// accounts never accept direct pushes from external clients).
    pub fn is_replica(&self) -> bool {
        !matches!(self, ReplicationStrategy::None)
    }

    /// Whether this account is specifically an *external*-upstream replica
    /// (the only kind `anonymous_first_pull` may apply to, spec.md §4.2, §4.7).
    pub fn is_external_replica(&self) -> bool {
        matches!(self, ReplicationStrategy::FromExternalOnFirstUse { .. })
    }
}

/// Serialized policy sets carried by an account (spec.md §3 Account,
/// §6 Account JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySets {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gc_policies: Vec<GcPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rbac_policies: Vec<RbacPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_policies: Vec<TagPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_scan_policies: Vec<SecurityScanPolicy>,
}

/// Top-level tenant namespace (spec.md §3 Account).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: AccountName,
    pub auth_tenant_id: String,
    #[serde(default)]
    pub replication: ReplicationStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform_filter: Vec<PlatformFilter>,
    /// CEL expression over `{labels, layers, media_type, repo_name}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_rule: Option<String>,
    #[serde(default)]
    pub policies: PolicySets,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub next_blob_sweep_at: DateTime<Utc>,
    pub next_storage_sweep_at: DateTime<Utc>,
    pub next_federation_announce_at: DateTime<Utc>,

    /// Staged-deletion flag (spec.md §4.8 account reconcile: set then let
    /// the other sweeps tear down contents).
    #[serde(default)]
    pub is_deleting: bool,
}

impl Default for ReplicationStrategy {
    fn default() -> Self {
        ReplicationStrategy::None
    }
}

impl Account {
    /// Whether an accepted platform (os, arch, variant) passes this
    /// account's filter; an empty filter accepts everything.
    pub fn accepts_platform(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        if self.platform_filter.is_empty() {
            return true;
        }
        self.platform_filter
            .iter()
            .any(|f| f.matches(os, architecture, variant))
    }
}
