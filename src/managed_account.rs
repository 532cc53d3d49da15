//! Managed-account driver (spec.md §4.8 account reconcile)
//!
//! A managed-account driver produces desired configuration for accounts
//! it owns; `None` means the driver wants the account torn down. The
//! account-reconcile sweep diffs its account rows against this each
//! cycle and applies the result.

use crate::error::Result;
use crate::model::{PlatformFilter, PolicySets, ReplicationStrategy};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Desired state for one managed account (spec.md §4.8: "apply desired
/// state (create/update config, or, if `None` returned, drive a staged
/// deletion: mark `is_deleting`, then let the other sweeps tear down
/// contents)").
#[derive(Debug, Clone)]
pub struct DesiredAccountState {
    pub auth_tenant_id: String,
    pub replication: ReplicationStrategy,
    pub platform_filter: Vec<PlatformFilter>,
    pub validation_rule: Option<String>,
    pub policies: PolicySets,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait ManagedAccountDriver: Send + Sync {
    /// Every account name this driver manages (spec.md §4.8: the
    /// reconcile sweep iterates the driver's own inventory, not a
    /// `next_…_at` schedule, since a managed account may not exist yet).
    async fn managed_accounts(&self) -> Result<Vec<String>>;
    /// Desired state for `account`, or `None` to request deletion.
    async fn desired_state(&self, account: &str) -> Result<Option<DesiredAccountState>>;
}

/// No managed-account driver configured: manages nothing.
pub struct NoopManagedAccounts;

#[async_trait]
impl ManagedAccountDriver for NoopManagedAccounts {
    async fn managed_accounts(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn desired_state(&self, _account: &str) -> Result<Option<DesiredAccountState>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_driver_manages_nothing() {
        let driver = NoopManagedAccounts;
        assert!(driver.managed_accounts().await.unwrap().is_empty());
    }
}
