// Single upstream delivery attempt
//
// Posts one already-sealed envelope and classifies what came back. Retrying
// is the caller's business.

use crate::delivery::retry::AttemptClass;
use crate::metrics;
use std::time::Instant;
use tracing::{debug, warn};

/// Header carrying the tenant key upstream
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Result of one POST
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub class: AttemptClass,
    /// `None` when no response was received
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    /// Human readable description for logs and outcome reasons
    pub detail: String,
}

/// POSTs sealed envelopes to the ingestion endpoint
#[derive(Debug, Clone)]
pub struct AttemptExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl AttemptExecutor {
    /// `client` carries the per-call timeout
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Make one attempt with a pre-serialized JSON body
    pub async fn post(&self, tenant_key: &str, body: &[u8], attempt: u32) -> AttemptResult {
        let start = Instant::now();

        let request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, tenant_key)
            .body(body.to_vec());

        let result = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let class = AttemptClass::from_status(status);
                let elapsed = start.elapsed().as_millis() as u64;

                debug!(
                    tenant_key,
                    attempt,
                    status,
                    elapsed_ms = elapsed,
                    "Delivery attempt answered"
                );

                let detail = match class {
                    AttemptClass::Success => format!("HTTP {}", status),
                    _ => {
                        // Body only matters for diagnostics
                        let body = response.text().await.unwrap_or_default();
                        let kind = if class == AttemptClass::Retryable {
                            "server error"
                        } else {
                            "client error"
                        };
                        format!("{} {}: {}", kind, status, truncate(&body, 256))
                    }
                };

                AttemptResult {
                    class,
                    status_code: Some(status),
                    response_time_ms: elapsed,
                    detail,
                }
            }
            Err(e) => {
                let elapsed = start.elapsed().as_millis() as u64;
                warn!(
                    tenant_key,
                    attempt,
                    elapsed_ms = elapsed,
                    error = %e,
                    "Delivery attempt failed without response"
                );

                AttemptResult {
                    class: AttemptClass::Retryable,
                    status_code: None,
                    response_time_ms: elapsed,
                    detail: format!("request failed: {}", e),
                }
            }
        };

        metrics::DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[result.class.as_str()])
            .inc();
        result
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        // Reserve a port, then free it so nothing is listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let executor = AttemptExecutor::new(reqwest::Client::new(), format!("http://{}/ingress", addr));
        let result = executor.post("k1", b"{}", 1).await;

        assert_eq!(result.class, AttemptClass::Retryable);
        assert!(result.status_code.is_none());
        assert!(result.detail.starts_with("request failed"));
    }
}
