// Retry policy and delivery state machine
//
// A delivery walks through:
//
//   Attempting(1) -> Attempting(2) -> ... -> Attempting(max)
//        |                                      |
//        +-> Delivered / PermanentlyRejected    +-> DeferredToQueue
//
// Transitions are keyed only by the classification of the last attempt, so
// the order of checks is fixed in one table instead of spread across
// branches. The delay between attempts is constant.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fixed-delay retry policy for one delivery call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per delivery call, including the first (>= 1)
    pub max_attempts: u32,
    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Attempt count after which a queued message is dropped for good
    pub fn queue_drop_ceiling(&self) -> u32 {
        self.max_attempts.saturating_mul(3)
    }
}

/// Classification of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    /// 2xx
    Success,
    /// Connection failure or 5xx
    Retryable,
    /// Any other non-2xx; the server will not accept this request
    Fatal,
}

impl AttemptClass {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => AttemptClass::Success,
            500..=599 => AttemptClass::Retryable,
            _ => AttemptClass::Fatal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptClass::Success => "success",
            AttemptClass::Retryable => "retryable",
            AttemptClass::Fatal => "fatal",
        }
    }
}

/// Where a delivery call currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// About to make attempt `n` (1-based)
    Attempting(u32),
    /// Upstream accepted the envelope
    Delivered,
    /// Upstream refused it; do not retry or queue
    PermanentlyRejected,
    /// Attempt ceiling exhausted on transient failures; caller may queue it
    DeferredToQueue,
}

impl DeliveryState {
    pub fn start() -> Self {
        DeliveryState::Attempting(1)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Attempting(_))
    }

    /// Transition table
    ///
    /// | state          | class     | condition  | next              |
    /// |----------------|-----------|------------|-------------------|
    /// | Attempting(n)  | Success   |            | Delivered         |
    /// | Attempting(n)  | Fatal     |            | PermanentlyRejected |
    /// | Attempting(n)  | Retryable | n < max    | Attempting(n + 1) |
    /// | Attempting(n)  | Retryable | n >= max   | DeferredToQueue   |
    /// | terminal       | any       |            | unchanged         |
    pub fn advance(self, class: AttemptClass, policy: &RetryPolicy) -> Self {
        match (self, class) {
            (DeliveryState::Attempting(_), AttemptClass::Success) => DeliveryState::Delivered,
            (DeliveryState::Attempting(_), AttemptClass::Fatal) => {
                DeliveryState::PermanentlyRejected
            }
            (DeliveryState::Attempting(n), AttemptClass::Retryable) if n < policy.max_attempts => {
                DeliveryState::Attempting(n + 1)
            }
            (DeliveryState::Attempting(_), AttemptClass::Retryable) => {
                DeliveryState::DeferredToQueue
            }
            (terminal, _) => terminal,
        }
    }
}
