//! RBAC policy evaluation (spec.md §4.2)
//!
//! This repository implements the variant of the RBAC policy model that
//! keeps `forbids` as a first-class field alongside `grants` (spec.md
//! §9 Open Question: "two variants... coexist in the source"). See
//! DESIGN.md for the rationale.

use crate::error::{Error, Result};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Pull,
    Push,
    Delete,
    AnonymousPull,
    AnonymousFirstPull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbacPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_username: Option<String>,
    pub permissions: BTreeSet<Permission>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub forbidden_permissions: BTreeSet<Permission>,
}

/// Facts needed to validate a policy against its owning account's shape.
pub struct AccountContext {
    pub is_external_replica: bool,
}

impl RbacPolicy {
    /// Syntactic validation, independent of any account (spec.md §4.2).
    pub fn validate(&self) -> Result<()> {
        if self.permissions.is_empty() {
            return Err(Error::PolicyInvalid(
                "RBAC policy must grant at least one permission".into(),
            ));
        }
        if self.cidr.is_none() && self.match_repository.is_none() && self.match_username.is_none() {
            return Err(Error::PolicyInvalid(
                "RBAC policy must have at least one match predicate".into(),
            ));
        }
        if let Some(ref cidr) = self.cidr {
            let net: IpNet = cidr
                .parse()
                .map_err(|e| Error::PolicyInvalid(format!("invalid CIDR {cidr:?}: {e}")))?;
            if net.prefix_len() == 0 {
                return Err(Error::PolicyInvalid(
                    "RBAC policy CIDR must not be 0.0.0.0/0 (or the IPv6 equivalent)".into(),
                ));
            }
        }
        if let Some(ref r) = self.match_repository {
            Regex::new(r).map_err(|e| Error::PolicyInvalid(format!("invalid match_repository: {e}")))?;
        }
        if let Some(ref r) = self.match_username {
            Regex::new(r).map_err(|e| Error::PolicyInvalid(format!("invalid match_username: {e}")))?;
        }

        let anon = self.permissions.contains(&Permission::AnonymousPull)
            || self.permissions.contains(&Permission::AnonymousFirstPull);
        if anon && self.match_username.is_some() {
            return Err(Error::PolicyInvalid(
                "anonymous_pull/anonymous_first_pull cannot be combined with a username match".into(),
            ));
        }
        if self.permissions.contains(&Permission::Pull)
            && self.cidr.is_none()
            && self.match_username.is_none()
        {
            return Err(Error::PolicyInvalid(
                "pull requires a CIDR or username match".into(),
            ));
        }
        if self.permissions.contains(&Permission::Push) && !self.permissions.contains(&Permission::Pull) {
            return Err(Error::PolicyInvalid("push requires pull".into()));
        }
        if self.permissions.contains(&Permission::Delete) && self.match_username.is_none() {
            return Err(Error::PolicyInvalid("delete requires a username match".into()));
        }
        for p in &self.permissions {
            if self.forbidden_permissions.contains(p) {
                return Err(Error::PolicyInvalid(format!(
                    "{p:?} cannot appear in both grants and forbids"
                )));
            }
        }
        Ok(())
    }

    /// Account-dependent validation: `anonymous_first_pull` is only legal
    /// on external-replica accounts (spec.md §4.2, §4.7).
    pub fn validate_for_account(&self, ctx: &AccountContext) -> Result<()> {
        self.validate()?;
        if self.permissions.contains(&Permission::AnonymousFirstPull) && !ctx.is_external_replica {
            return Err(Error::PolicyInvalid(
                "anonymous_first_pull is only valid on external-replica accounts".into(),
            ));
        }
        Ok(())
    }

    fn predicate_matches(&self, client_ip: Option<IpAddr>, repository: &str, username: Option<&str>) -> bool {
        if let Some(ref cidr) = self.cidr {
            let net: Result<IpNet> = cidr
                .parse()
                .map_err(|e| Error::PolicyInvalid(format!("invalid CIDR: {e}")));
            match (net, client_ip) {
                (Ok(net), Some(ip)) if net.contains(&ip) => {}
                _ => return false,
            }
        }
        if let Some(ref r) = self.match_repository {
            match Regex::new(r) {
                Ok(re) if re.is_match(repository) => {}
                _ => return false,
            }
        }
        if let Some(ref r) = self.match_username {
            match (Regex::new(r), username) {
                (Ok(re), Some(u)) if re.is_match(u) => {}
                _ => return false,
            }
        }
        true
    }

    /// Whether this policy grants `permission` for the given request facts.
    pub fn grants(
        &self,
        permission: Permission,
        client_ip: Option<IpAddr>,
        repository: &str,
        username: Option<&str>,
    ) -> bool {
        if !self.predicate_matches(client_ip, repository, username) {
            return false;
        }
        self.permissions.contains(&permission) && !self.forbidden_permissions.contains(&permission)
    }
}

/// Evaluate an ordered list of RBAC policies: granted iff at least one
/// policy grants the permission and none of them forbids it for a
/// matching predicate.
pub fn is_allowed(
    policies: &[RbacPolicy],
    permission: Permission,
    client_ip: Option<IpAddr>,
    repository: &str,
    username: Option<&str>,
) -> bool {
    let mut granted = false;
    for policy in policies {
        if !policy.predicate_matches(client_ip, repository, username) {
            continue;
        }
        if policy.forbidden_permissions.contains(&permission) {
            return false;
        }
        if policy.permissions.contains(&permission) {
            granted = true;
        }
    }
    granted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(permissions: &[Permission]) -> RbacPolicy {
        RbacPolicy {
            cidr: None,
            match_repository: None,
            match_username: Some("alice".to_string()),
            permissions: permissions.iter().copied().collect(),
            forbidden_permissions: BTreeSet::new(),
        }
    }

    #[test]
    fn empty_permissions_invalid() {
        let p = base(&[]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn no_predicate_invalid() {
        let mut p = base(&[Permission::Pull]);
        p.match_username = None;
        assert!(p.validate().is_err());
    }

    #[test]
    fn full_cidr_invalid() {
        let mut p = base(&[Permission::Pull]);
        p.cidr = Some("0.0.0.0/0".to_string());
        assert!(p.validate().is_err());
    }

    #[test]
    fn anon_with_username_invalid() {
        let p = base(&[Permission::AnonymousPull]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn push_without_pull_invalid() {
        let p = base(&[Permission::Push]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn delete_without_username_invalid() {
        let mut p = base(&[Permission::Pull, Permission::Delete]);
        p.match_username = None;
        p.cidr = Some("10.0.0.0/8".to_string());
        assert!(p.validate().is_err());
    }

    #[test]
    fn overlap_between_grants_and_forbids_invalid() {
        let mut p = base(&[Permission::Pull]);
        p.forbidden_permissions.insert(Permission::Pull);
        assert!(p.validate().is_err());
    }

    #[test]
    fn anonymous_first_pull_requires_external_replica() {
        let mut p = base(&[]);
        p.match_username = None;
        p.permissions = [Permission::AnonymousFirstPull].into_iter().collect();
        let ctx_ok = AccountContext { is_external_replica: true };
        let ctx_bad = AccountContext { is_external_replica: false };
        assert!(p.validate_for_account(&ctx_ok).is_ok());
        assert!(p.validate_for_account(&ctx_bad).is_err());
    }

    #[test]
    fn valid_policy_grants_permission() {
        let p = base(&[Permission::Pull, Permission::Push]);
        assert!(p.validate().is_ok());
        assert!(p.grants(Permission::Pull, None, "acct/repo", Some("alice")));
        assert!(!p.grants(Permission::Pull, None, "acct/repo", Some("bob")));
    }

    #[test]
    fn is_allowed_checks_all_policies_forbid_wins() {
        let mut forbid = base(&[]);
        forbid.match_username = Some(".*".to_string());
        forbid.forbidden_permissions = [Permission::Pull].into_iter().collect();
        forbid.permissions = [Permission::Push, Permission::Pull].into_iter().collect();
        // construct grant policy too but forbid should win since both match
        let grant = base(&[Permission::Pull]);
        let policies = vec![grant, forbid];
        assert!(!is_allowed(&policies, Permission::Pull, None, "acct/repo", Some("alice")));
    }
}
