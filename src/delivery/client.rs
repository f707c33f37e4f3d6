// Delivery client - seals a payload and drives the retry state machine
//
// One `send` call makes up to `max_attempts` POSTs, pausing a fixed delay
// between them. Worst case it blocks for
// max_attempts * (timeout + delay).

use crate::credentials::CredentialStore;
use crate::crypto;
use crate::delivery::attempt::{AttemptExecutor, AttemptResult};
use crate::delivery::retry::{AttemptClass, DeliveryState, RetryPolicy};
use crate::delivery::{Deliver, DeliveryOutcome, FailureKind};
use crate::metrics;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Path appended to the configured server URL
pub const INGRESS_PATH: &str = "/ingress";

/// Delivers tenant payloads to the upstream ingestion endpoint
pub struct DeliveryClient {
    executor: AttemptExecutor,
    policy: RetryPolicy,
    credentials: CredentialStore,
}

impl DeliveryClient {
    /// Create a client for `server_url` with a per-call `timeout`
    pub fn new(
        server_url: &str,
        timeout: Duration,
        policy: RetryPolicy,
        credentials: CredentialStore,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!("{}{}", server_url.trim_end_matches('/'), INGRESS_PATH);

        Ok(Self {
            executor: AttemptExecutor::new(http, endpoint),
            policy,
            credentials,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.executor.endpoint()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn finish(&self, tenant_key: &str, outcome: DeliveryOutcome) -> DeliveryOutcome {
        let label = match &outcome {
            DeliveryOutcome::Delivered { attempts } => {
                info!(tenant_key, attempts, "Payload delivered");
                "delivered"
            }
            DeliveryOutcome::Failed { kind, reason, attempts } => {
                warn!(
                    tenant_key,
                    attempts,
                    kind = kind.label(),
                    retryable = kind.is_retryable(),
                    "Delivery failed: {}",
                    reason
                );
                kind.label()
            }
        };
        metrics::DELIVERIES_TOTAL.with_label_values(&[label]).inc();
        outcome
    }
}

fn failure_kind(result: &AttemptResult) -> FailureKind {
    match (result.class, result.status_code) {
        (_, None) => FailureKind::Transport,
        (AttemptClass::Retryable, Some(status)) => FailureKind::Server(status),
        (_, Some(status)) => FailureKind::Client(status),
    }
}

#[async_trait]
impl Deliver for DeliveryClient {
    async fn send(&self, tenant_key: &str, payload: &Value) -> DeliveryOutcome {
        let credential = match self.credentials.lookup(tenant_key) {
            Some(credential) => credential,
            None => {
                let reason = format!("unknown tenant key: {}", tenant_key);
                return self.finish(
                    tenant_key,
                    DeliveryOutcome::failed(FailureKind::UnknownCredential, reason, 0),
                );
            }
        };

        let body = match crypto::encrypt_payload(payload, &credential)
            .and_then(|envelope| serde_json::to_vec(&envelope).map_err(Into::into))
        {
            Ok(body) => body,
            Err(e) => {
                let reason = format!("encryption failed: {}", e);
                return self.finish(
                    tenant_key,
                    DeliveryOutcome::failed(FailureKind::Encryption, reason, 0),
                );
            }
        };

        let mut state = DeliveryState::start();
        let mut attempts = 0;
        let mut last: Option<AttemptResult> = None;

        while let DeliveryState::Attempting(n) = state {
            let result = self.executor.post(tenant_key, &body, n).await;
            attempts = n;
            state = state.advance(result.class, &self.policy);

            if let DeliveryState::Attempting(next) = state {
                debug!(
                    tenant_key,
                    next_attempt = next,
                    delay_ms = self.policy.delay.as_millis() as u64,
                    "Retrying delivery: {}",
                    result.detail
                );
                tokio::time::sleep(self.policy.delay).await;
            }
            last = Some(result);
        }

        let outcome = match (state, last) {
            (DeliveryState::Delivered, _) => DeliveryOutcome::Delivered { attempts },
            (DeliveryState::PermanentlyRejected, Some(result)) => {
                DeliveryOutcome::failed(failure_kind(&result), result.detail, attempts)
            }
            (DeliveryState::DeferredToQueue, Some(result)) => DeliveryOutcome::failed(
                failure_kind(&result),
                format!("all {} attempts failed: {}", attempts, result.detail),
                attempts,
            ),
            // The loop always runs at least once and ends in a terminal state
            (state, _) => DeliveryOutcome::failed(
                FailureKind::Transport,
                format!("delivery ended in unexpected state {:?}", state),
                attempts,
            ),
        };

        self.finish(tenant_key, outcome)
    }
}
