//! Peer deployment record (spec.md §3 Peer, §6 Peer protocol).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Another Keppel deployment known by hostname, with rotated inbound
/// credentials (spec.md §3 Peer, §5: "hourly-rotated with overlap").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub hostname: String,
    /// Password we present to this peer when acting as a client.
    pub our_password: String,
    /// Current inbound password hash this peer authenticates with.
    pub their_current_password_hash: String,
    /// Previous inbound password hash, kept valid during the rotation
    /// overlap window.
    pub their_previous_password_hash: Option<String>,
    pub last_peered_at: Option<DateTime<Utc>>,
}

impl Peer {
    /// Whether `hash` matches either the current or the overlap-window
    /// previous inbound credential.
    pub fn accepts_inbound_hash(&self, hash: &str) -> bool {
        self.their_current_password_hash == hash
            || self.their_previous_password_hash.as_deref() == Some(hash)
    }
}

/// One entry of a peer's `_sync_replica` response (spec.md §6 Peer
/// protocol `ReplicaSyncPayload`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSyncTag {
    pub name: String,
    pub last_pulled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSyncManifest {
    pub digest: String,
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub tags: Vec<ReplicaSyncTag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSyncPayload {
    pub manifests: Vec<ReplicaSyncManifest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer {
            hostname: "peer.example.org".to_string(),
            our_password: "outbound-secret".to_string(),
            their_current_password_hash: "hash-current".to_string(),
            their_previous_password_hash: Some("hash-previous".to_string()),
            last_peered_at: None,
        }
    }

    #[test]
    fn accepts_current_and_previous_hash() {
        let p = peer();
        assert!(p.accepts_inbound_hash("hash-current"));
        assert!(p.accepts_inbound_hash("hash-previous"));
        assert!(!p.accepts_inbound_hash("hash-stale"));
    }

    #[test]
    fn sync_payload_round_trips_through_json() {
        let payload = ReplicaSyncPayload {
            manifests: vec![ReplicaSyncManifest {
                digest: "sha256:aaaa".to_string(),
                last_pulled_at: None,
                tags: vec![ReplicaSyncTag {
                    name: "latest".to_string(),
                    last_pulled_at: None,
                }],
            }],
        };
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: ReplicaSyncPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.manifests.len(), 1);
        assert_eq!(parsed.manifests[0].tags[0].name, "latest");
    }
}
