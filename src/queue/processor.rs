// Queue processor - drains the offline queue on a fixed interval
//
// `drain_cycle` holds all the policy and knows nothing about time, so tests
// call it directly. `run` is only the timer around it.
//
// Per message, oldest first:
// - delivered                        -> remove, continue
// - non-retryable failure            -> remove (dropped), continue
// - retryable, attempts >= ceiling   -> remove (dropped), continue
// - retryable, attempts <  ceiling   -> increment attempts, end the cycle

use crate::delivery::{Deliver, DeliveryOutcome};
use crate::metrics;
use crate::queue::{PersistentQueue, QueueError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one drain cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub dropped: usize,
    /// Whether the cycle stopped on a message that will be retried next tick
    pub deferred: bool,
}

pub struct QueueProcessor {
    queue: Arc<PersistentQueue>,
    delivery: Arc<dyn Deliver>,
    drop_ceiling: u32,
    interval: Duration,
    cycle: Mutex<()>,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<PersistentQueue>,
        delivery: Arc<dyn Deliver>,
        drop_ceiling: u32,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            delivery,
            drop_ceiling,
            interval,
            cycle: Mutex::new(()),
        }
    }

    /// Run one drain cycle to completion
    ///
    /// Cycles never overlap: a second caller waits for the first to finish.
    pub async fn drain_cycle(&self) -> Result<DrainReport, QueueError> {
        let _guard = self.cycle.lock().await;
        let mut report = DrainReport::default();

        while let Some(message) = self.queue.dequeue()? {
            let outcome = self.delivery.send(&message.tenant_key, &message.payload).await;

            match outcome {
                DeliveryOutcome::Delivered { .. } => {
                    self.queue.remove(message.id)?;
                    report.delivered += 1;
                    debug!(id = message.id, tenant_key = %message.tenant_key, "Queued message delivered");
                }
                DeliveryOutcome::Failed { kind, reason, .. } if !kind.is_retryable() => {
                    self.queue.remove(message.id)?;
                    report.dropped += 1;
                    metrics::QUEUE_DROPPED_TOTAL.with_label_values(&["rejected"]).inc();
                    warn!(
                        id = message.id,
                        tenant_key = %message.tenant_key,
                        kind = kind.label(),
                        "Dropping queued message after permanent failure: {}",
                        reason
                    );
                }
                DeliveryOutcome::Failed { reason, .. } if message.attempts >= self.drop_ceiling => {
                    self.queue.remove(message.id)?;
                    report.dropped += 1;
                    metrics::QUEUE_DROPPED_TOTAL
                        .with_label_values(&["max_attempts"])
                        .inc();
                    warn!(
                        id = message.id,
                        tenant_key = %message.tenant_key,
                        attempts = message.attempts,
                        ceiling = self.drop_ceiling,
                        "Dropping queued message after exceeding max attempts: {}",
                        reason
                    );
                }
                DeliveryOutcome::Failed { reason, .. } => {
                    self.queue.increment_attempts(message.id)?;
                    report.deferred = true;
                    debug!(
                        id = message.id,
                        attempts = message.attempts + 1,
                        "Queued message still failing, retrying next tick: {}",
                        reason
                    );
                    break;
                }
            }
        }

        if report.delivered > 0 || report.dropped > 0 {
            info!(
                delivered = report.delivered,
                dropped = report.dropped,
                remaining = self.queue.size()?,
                "Drain cycle finished"
            );
        }
        Ok(report)
    }

    /// Drain every `interval` until `shutdown` flips to true
    ///
    /// The first tick fires one interval after start. A cycle in progress
    /// is allowed to finish before the loop observes shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "Queue processor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_cycle().await {
                        error!("Drain cycle failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Queue processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::FailureKind;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    /// Replays scripted outcomes and records every payload it was given
    struct ScriptedDelivery {
        script: SyncMutex<VecDeque<DeliveryOutcome>>,
        seen: SyncMutex<Vec<Value>>,
    }

    impl ScriptedDelivery {
        fn new(script: Vec<DeliveryOutcome>) -> Arc<Self> {
            Arc::new(Self {
                script: SyncMutex::new(script.into()),
                seen: SyncMutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Value> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Deliver for ScriptedDelivery {
        async fn send(&self, _tenant_key: &str, payload: &Value) -> DeliveryOutcome {
            self.seen.lock().push(payload.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or(DeliveryOutcome::Delivered { attempts: 1 })
        }
    }

    fn ok() -> DeliveryOutcome {
        DeliveryOutcome::Delivered { attempts: 1 }
    }

    fn transient() -> DeliveryOutcome {
        DeliveryOutcome::failed(FailureKind::Server(503), "unavailable", 3)
    }

    fn permanent() -> DeliveryOutcome {
        DeliveryOutcome::failed(FailureKind::Client(400), "bad request", 1)
    }

    fn setup(script: Vec<DeliveryOutcome>, ceiling: u32) -> (Arc<PersistentQueue>, Arc<ScriptedDelivery>, QueueProcessor) {
        let queue = Arc::new(PersistentQueue::open_in_memory(100).unwrap());
        let delivery = ScriptedDelivery::new(script);
        let processor = QueueProcessor::new(
            Arc::clone(&queue),
            delivery.clone(),
            ceiling,
            Duration::from_millis(10),
        );
        (queue, delivery, processor)
    }

    #[tokio::test]
    async fn test_drains_everything_in_order() {
        let (queue, delivery, processor) = setup(vec![], 9);
        for n in 0..3 {
            queue.enqueue("k1", &json!({ "n": n })).unwrap();
        }

        let report = processor.drain_cycle().await.unwrap();

        assert_eq!(report, DrainReport { delivered: 3, dropped: 0, deferred: false });
        assert_eq!(queue.size().unwrap(), 0);
        assert_eq!(delivery.seen(), vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let (_queue, delivery, processor) = setup(vec![], 9);
        let report = processor.drain_cycle().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(delivery.seen().is_empty());
    }

    #[tokio::test]
    async fn test_head_of_line_blocking() {
        let (queue, delivery, processor) = setup(vec![transient()], 9);
        let head = queue.enqueue("k1", &json!({"n": "old"})).unwrap();
        queue.enqueue("k1", &json!({"n": "young"})).unwrap();

        let report = processor.drain_cycle().await.unwrap();

        assert!(report.deferred);
        assert_eq!(report.delivered, 0);
        // The younger message was never attempted
        assert_eq!(delivery.seen(), vec![json!({"n": "old"})]);
        assert_eq!(queue.size().unwrap(), 2);

        let stuck = queue.dequeue().unwrap().unwrap();
        assert_eq!(stuck.id, head);
        assert_eq!(stuck.attempts, 1);

        // Next tick: the script is empty so both go through, oldest first
        let report = processor.drain_cycle().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(
            delivery.seen(),
            vec![json!({"n": "old"}), json!({"n": "old"}), json!({"n": "young"})]
        );
    }

    #[tokio::test]
    async fn test_non_retryable_is_dropped_and_cycle_continues() {
        let (queue, delivery, processor) = setup(vec![permanent(), ok()], 9);
        queue.enqueue("k1", &json!({"n": 1})).unwrap();
        queue.enqueue("k1", &json!({"n": 2})).unwrap();

        let report = processor.drain_cycle().await.unwrap();

        assert_eq!(report, DrainReport { delivered: 1, dropped: 1, deferred: false });
        assert_eq!(delivery.seen().len(), 2);
        assert_eq!(queue.size().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_drop_at_ceiling() {
        let ceiling = 3;
        let (queue, _delivery, processor) = setup(vec![transient(); 10], ceiling);
        let id = queue.enqueue("k1", &json!({})).unwrap();

        // Each cycle below the ceiling only bumps the counter
        for expected in 1..=ceiling {
            let report = processor.drain_cycle().await.unwrap();
            assert!(report.deferred);
            assert_eq!(queue.dequeue().unwrap().unwrap().attempts, expected);
        }

        // attempts == ceiling: still retryable, but dropped
        let report = processor.drain_cycle().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(!report.deferred);
        assert!(queue.dequeue().unwrap().is_none());
        queue.remove(id).unwrap();
    }

    #[tokio::test]
    async fn test_drop_at_ceiling_lets_next_message_through() {
        let (queue, delivery, processor) = setup(vec![transient(), ok()], 0);
        queue.enqueue("k1", &json!({"n": 1})).unwrap();
        queue.enqueue("k1", &json!({"n": 2})).unwrap();

        let report = processor.drain_cycle().await.unwrap();

        assert_eq!(report, DrainReport { delivered: 1, dropped: 1, deferred: false });
        assert_eq!(delivery.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_run_drains_on_tick_and_stops() {
        let (queue, _delivery, processor) = setup(vec![], 9);
        queue.enqueue("k1", &json!({"n": 1})).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(processor).run(rx));

        for _ in 0..100 {
            if queue.size().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.size().unwrap(), 0);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
