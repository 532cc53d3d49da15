//! Federation driver (spec.md §4.8 federation announce)
//!
//! Abstracts whatever external directory tracks which registry instance
//! owns which account, so the federation-announce sweep can assert
//! continued ownership without the janitor depending on a concrete
//! federation implementation.

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait FederationDriver: Send + Sync {
    async fn announce(&self, account: &str) -> Result<()>;
}

/// No federation configured: announces are a no-op.
pub struct NoopFederation;

#[async_trait]
impl FederationDriver for NoopFederation {
    async fn announce(&self, _account: &str) -> Result<()> {
        Ok(())
    }
}
