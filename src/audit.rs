//! Audit event envelope (spec.md §2 "Auditing & rate limiting").
//!
//! Shipping an audit log to a sink is an external collaborator (spec.md
//! §1: "audit-log shipping"); this module only fixes the envelope every
//! mutating engine operation would emit, plus the pluggable [`AuditSink`]
//! an external shipper implements against `Config::audit_sink_url`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audited mutation. `action`/`target` follow the engine's own
/// operation names (e.g. `action: "tag/push"`, `target: "library/nginx:latest"`)
/// rather than free English, so a sink can filter without parsing prose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub time: DateTime<Utc>,
    pub account: String,
    /// Opaque caller identity; resolving it from a bearer token is an
    /// (external) auth-driver concern.
    pub actor: String,
    pub action: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(time: DateTime<Utc>, account: impl Into<String>, actor: impl Into<String>, action: impl Into<String>, target: impl Into<String>) -> Self {
        Self { time, account: account.into(), actor: actor.into(), action: action.into(), target: target.into(), reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Where audited events go. The core calls this after a mutation
/// commits; it never blocks the mutation on the sink's own durability.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Reference sink: structured `tracing` output. Used until a driver for
/// `Config::audit_sink_url` is wired by the (external) binary that owns
/// the HTTP edge.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        tracing::info!(
            account = %event.account,
            actor = %event.actor,
            action = %event.action,
            target = %event.target,
            reason = event.reason.as_deref().unwrap_or(""),
            "audit event"
        );
    }
}
