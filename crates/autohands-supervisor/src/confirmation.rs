//! Two-phase confirmation for destructive manual actions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{SupervisorError, SupervisorResult};

/// Token returned by `request_kill`, required by the matching `kill`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillConfirmation {
    pub token: Uuid,
    pub resource_id: String,
    pub expires_at: DateTime<Utc>,
}

struct Issued {
    resource_id: String,
    deadline: Instant,
}

/// Outstanding confirmation tokens. Each token is single-use.
pub struct ConfirmationLedger {
    ttl: Duration,
    issued: DashMap<Uuid, Issued>,
}

impl ConfirmationLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            issued: DashMap::new(),
        }
    }

    /// Issue a token for `resource_id`.
    pub fn issue(&self, resource_id: &str) -> KillConfirmation {
        self.prune();
        let token = Uuid::new_v4();
        self.issued.insert(
            token,
            Issued {
                resource_id: resource_id.to_string(),
                deadline: Instant::now() + self.ttl,
            },
        );
        debug!("Issued kill confirmation for {}", resource_id);

        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        KillConfirmation {
            token,
            resource_id: resource_id.to_string(),
            expires_at,
        }
    }

    /// Consume a token. Fails unless it is live and issued for `resource_id`.
    ///
    /// A token presented for the wrong resource stays valid for the right one.
    pub fn consume(&self, resource_id: &str, token: Uuid) -> SupervisorResult<()> {
        let now = Instant::now();
        self.issued
            .remove_if(&token, |_, issued| {
                issued.resource_id == resource_id && issued.deadline > now
            })
            .map(|_| ())
            .ok_or_else(|| SupervisorError::ConfirmationRequired(resource_id.to_string()))
    }

    /// Drop expired tokens.
    pub fn prune(&self) {
        let now = Instant::now();
        self.issued.retain(|_, issued| issued.deadline > now);
    }

    /// Outstanding tokens, expired ones included until pruned.
    pub fn len(&self) -> usize {
        self.issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_is_single_use() {
        let ledger = ConfirmationLedger::new(Duration::from_secs(60));
        let confirmation = ledger.issue("r1");
        assert_eq!(confirmation.resource_id, "r1");
        assert!(confirmation.expires_at > Utc::now());

        assert!(ledger.consume("r1", confirmation.token).is_ok());
        assert!(matches!(
            ledger.consume("r1", confirmation.token),
            Err(SupervisorError::ConfirmationRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_token_bound_to_resource() {
        let ledger = ConfirmationLedger::new(Duration::from_secs(60));
        let confirmation = ledger.issue("r1");
        assert!(ledger.consume("r2", confirmation.token).is_err());
        assert!(ledger.consume("r1", confirmation.token).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let ledger = ConfirmationLedger::new(Duration::from_secs(60));
        assert!(ledger.consume("r1", Uuid::new_v4()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expires() {
        let ledger = ConfirmationLedger::new(Duration::from_secs(60));
        let confirmation = ledger.issue("r1");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(ledger.consume("r1", confirmation.token).is_err());

        ledger.prune();
        assert!(ledger.is_empty());
    }
}
