// Upstream delivery with bounded retry
//
// Handles:
// - Credential lookup and envelope sealing
// - Outbound POST attempts with a fixed delay between them
// - Classification of every failure as retryable or not
//
// Nothing in here returns an error: each branch ends in a `DeliveryOutcome`
// that callers use to decide whether to buffer the payload.

pub mod attempt;
pub mod client;
pub mod retry;

pub use client::DeliveryClient;
pub use retry::{AttemptClass, DeliveryState, RetryPolicy};

use async_trait::async_trait;
use serde_json::Value;

/// Why a delivery did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Tenant key not in the active credential snapshot (misconfiguration)
    UnknownCredential,
    /// Secret decoding, serialization, derivation or sealing failed
    Encryption,
    /// No response from upstream
    Transport,
    /// Upstream answered 5xx
    Server(u16),
    /// Upstream answered any other non-2xx
    Client(u16),
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transport | FailureKind::Server(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::UnknownCredential => "unknown_credential",
            FailureKind::Encryption => "encryption_error",
            FailureKind::Transport => "transport_error",
            FailureKind::Server(_) => "server_error",
            FailureKind::Client(_) => "client_error",
        }
    }
}

/// Final result of one `send` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        attempts: u32,
    },
    Failed {
        kind: FailureKind,
        reason: String,
        attempts: u32,
    },
}

impl DeliveryOutcome {
    pub fn failed(kind: FailureKind, reason: impl Into<String>, attempts: u32) -> Self {
        DeliveryOutcome::Failed {
            kind,
            reason: reason.into(),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    /// Whether buffering and trying again later makes sense. Always false on success.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryOutcome::Delivered { .. } => false,
            DeliveryOutcome::Failed { kind, .. } => kind.is_retryable(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            DeliveryOutcome::Delivered { .. } => "data sent successfully",
            DeliveryOutcome::Failed { reason, .. } => reason,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts } | DeliveryOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Anything that can push a tenant payload upstream
///
/// Implemented by [`DeliveryClient`]; the gateway and queue processor only
/// depend on this seam.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn send(&self, tenant_key: &str, payload: &Value) -> DeliveryOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_retry_classification() {
        assert!(FailureKind::Transport.is_retryable());
        assert!(FailureKind::Server(500).is_retryable());
        assert!(!FailureKind::Client(400).is_retryable());
        assert!(!FailureKind::UnknownCredential.is_retryable());
        assert!(!FailureKind::Encryption.is_retryable());
    }

    #[test]
    fn test_outcome_accessors() {
        let ok = DeliveryOutcome::Delivered { attempts: 2 };
        assert!(ok.is_success());
        assert!(!ok.is_retryable());
        assert_eq!(ok.attempts(), 2);
        assert!(ok.failure_kind().is_none());

        let failed = DeliveryOutcome::failed(FailureKind::Server(502), "bad gateway", 3);
        assert!(!failed.is_success());
        assert!(failed.is_retryable());
        assert_eq!(failed.reason(), "bad gateway");
        assert_eq!(failed.failure_kind(), Some(FailureKind::Server(502)));
    }
}
