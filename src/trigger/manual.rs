//! Caller-driven trigger for tests and embedding.
//!
//! `ManualHandle::fire()` produces one delivery; every acknowledgment is
//! recorded so callers can assert on outcomes and on the
//! one-respond-per-delivery contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TriggerError;
use crate::trigger::{Delivery, DeliveryTag, Outcome, PollError, Trigger};

/// One recorded acknowledgment.
#[derive(Debug, Clone)]
pub struct RecordedOutcome {
    pub tag: String,
    pub consumed: bool,
    /// Rendered error for failed deliveries.
    pub error: Option<String>,
}

#[derive(Default)]
struct Shared {
    outcomes: Mutex<Vec<RecordedOutcome>>,
    outstanding: AtomicUsize,
    /// Times `next_message` was entered while a tag was still
    /// unacknowledged — always zero under a well-behaved caller.
    violations: AtomicUsize,
}

/// Fires when the paired [`ManualHandle`] says so.
pub struct ManualTrigger {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<serde_json::Value>>,
    shared: Arc<Shared>,
}

/// Caller side of a [`ManualTrigger`].
#[derive(Clone)]
pub struct ManualHandle {
    tx: mpsc::UnboundedSender<serde_json::Value>,
    shared: Arc<Shared>,
}

impl ManualTrigger {
    /// Build a trigger and the handle that drives it.
    pub fn channel() -> (Self, ManualHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let trigger = Self {
            rx: tokio::sync::Mutex::new(rx),
            shared: Arc::clone(&shared),
        };
        (trigger, ManualHandle { tx, shared })
    }
}

impl ManualHandle {
    /// Produce one delivery with a null payload.
    pub fn fire(&self) {
        self.fire_with(serde_json::Value::Null);
    }

    /// Produce one delivery carrying `payload`.
    pub fn fire_with(&self, payload: serde_json::Value) {
        let _ = self.tx.send(payload);
    }

    /// Acknowledgments recorded so far, in respond order.
    pub fn outcomes(&self) -> Vec<RecordedOutcome> {
        self.shared.outcomes.lock().unwrap().clone()
    }

    /// Deliveries handed out but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Times the caller polled again with a tag still unacknowledged.
    pub fn violations(&self) -> usize {
        self.shared.violations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Trigger for ManualTrigger {
    async fn init(&mut self, _config: &[u8]) -> Result<(), TriggerError> {
        Ok(())
    }

    async fn next_message(&self) -> Result<Delivery, PollError> {
        if self.shared.outstanding.load(Ordering::SeqCst) > 0 {
            self.shared.violations.fetch_add(1, Ordering::SeqCst);
        }

        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(payload) => {
                self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
                Ok(Delivery {
                    tag: DeliveryTag::new(),
                    payload,
                })
            }
            None => {
                // All handles dropped. Park instead of erroring so the
                // orchestrator does not hot-loop on a dead source; callers
                // stop the loop via its stop flag.
                debug!("manual trigger source closed; parking");
                std::future::pending().await
            }
        }
    }

    async fn respond(&self, tag: DeliveryTag, outcome: Outcome) -> Result<(), TriggerError> {
        self.shared
            .outstanding
            .fetch_sub(1, Ordering::SeqCst);

        let recorded = match &outcome {
            Outcome::Consumed => RecordedOutcome {
                tag: tag.to_string(),
                consumed: true,
                error: None,
            },
            Outcome::Failed(e) => RecordedOutcome {
                tag: tag.to_string(),
                consumed: false,
                error: Some(e.to_string()),
            },
        };
        self.shared.outcomes.lock().unwrap().push(recorded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn fire_produces_delivery_with_payload() {
        let (trigger, handle) = ManualTrigger::channel();
        handle.fire_with(serde_json::json!({"run": 1}));

        let delivery = trigger.next_message().await.unwrap();
        assert_eq!(delivery.payload["run"], 1);
        assert_eq!(handle.outstanding(), 1);
    }

    #[tokio::test]
    async fn respond_records_outcomes_in_order() {
        let (trigger, handle) = ManualTrigger::channel();

        handle.fire();
        let first = trigger.next_message().await.unwrap();
        trigger.respond(first.tag, Outcome::Consumed).await.unwrap();

        handle.fire();
        let second = trigger.next_message().await.unwrap();
        trigger
            .respond(
                second.tag,
                Outcome::Failed(Error::Trigger(TriggerError::Closed)),
            )
            .await
            .unwrap();

        let outcomes = handle.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].consumed);
        assert!(!outcomes[1].consumed);
        assert!(outcomes[1].error.as_deref().unwrap().contains("closed"));
        assert_eq!(handle.outstanding(), 0);
        assert_eq!(handle.violations(), 0);
    }

    #[tokio::test]
    async fn polling_with_outstanding_tag_is_a_violation() {
        let (trigger, handle) = ManualTrigger::channel();
        handle.fire();
        handle.fire();

        let _first = trigger.next_message().await.unwrap();
        let _second = trigger.next_message().await.unwrap();

        assert_eq!(handle.violations(), 1);
    }

    #[tokio::test]
    async fn closed_source_parks_instead_of_erroring() {
        let (trigger, handle) = ManualTrigger::channel();
        drop(handle);

        let poll = tokio::time::timeout(Duration::from_millis(50), trigger.next_message()).await;
        assert!(poll.is_err(), "expected the poll to still be pending");
    }
}
