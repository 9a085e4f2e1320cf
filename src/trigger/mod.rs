//! Trigger contract — pluggable sources of work with an acknowledgment
//! protocol.
//!
//! Any source satisfying [`Trigger`] plugs into the loop with identical
//! orchestration behavior: a schedule-based poll ([`CronTrigger`]), a
//! caller-driven fire ([`ManualTrigger`]), or anything else that can hand
//! out deliveries and take acknowledgments.

pub mod cron;
pub mod manual;

pub use cron::CronTrigger;
pub use manual::{ManualHandle, ManualTrigger};

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, TriggerError};

/// Opaque per-delivery acknowledgment handle.
///
/// Identifies one delivery attempt, not the item itself — a redelivered
/// item gets a fresh tag. Deliberately neither `Clone` nor `Copy`:
/// [`Trigger::respond`] takes the tag by value, so acknowledging the same
/// delivery twice does not compile.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag(Uuid);

impl DeliveryTag {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One unit of work surfaced by a trigger.
#[derive(Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Trigger-specific payload (fire time for a cron trigger, caller data
    /// for a manual one). Opaque to the orchestrator.
    pub payload: serde_json::Value,
}

/// Error from [`Trigger::next_message`].
///
/// May still carry a tag — the caller must acknowledge it even though the
/// poll failed, so the source can close out the delivery attempt.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct PollError {
    pub tag: Option<DeliveryTag>,
    #[source]
    pub source: TriggerError,
}

impl PollError {
    pub fn new(source: TriggerError) -> Self {
        Self { tag: None, source }
    }

    pub fn with_tag(tag: DeliveryTag, source: TriggerError) -> Self {
        Self {
            tag: Some(tag),
            source,
        }
    }
}

/// Terminal result of one delivery attempt, handed back to the trigger.
#[derive(Debug)]
pub enum Outcome {
    /// Processed, or nothing to process. The source may discard the item.
    Consumed,
    /// Processing failed; the source decides whether to redeliver.
    Failed(Error),
}

impl Outcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Consumed => "consumed",
            Self::Failed(_) => "failed",
        }
    }
}

/// A pluggable source of work items.
///
/// The loop pairs every successful `next_message` with exactly one
/// `respond` before polling again, so implementations never see more than
/// one outstanding tag.
#[async_trait]
pub trait Trigger: Send + Sync {
    /// One-time setup from an opaque configuration blob. Called once,
    /// before the loop starts; failure is fatal to pipeline startup.
    async fn init(&mut self, config: &[u8]) -> Result<(), TriggerError>;

    /// Block until the next unit of work is due.
    async fn next_message(&self) -> Result<Delivery, PollError>;

    /// Finalize the delivery for `tag`. Consuming the tag closes the
    /// delivery attempt; redelivery policy is the trigger's business.
    async fn respond(&self, tag: DeliveryTag, outcome: Outcome) -> Result<(), TriggerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_unique_per_delivery() {
        let a = DeliveryTag::new();
        let b = DeliveryTag::new();
        assert_ne!(a, b);
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(Outcome::Consumed.label(), "consumed");
        let failed = Outcome::Failed(Error::Trigger(TriggerError::Closed));
        assert_eq!(failed.label(), "failed");
    }

    #[test]
    fn poll_error_carries_optional_tag() {
        let bare = PollError::new(TriggerError::Poll {
            reason: "source gone".into(),
        });
        assert!(bare.tag.is_none());

        let tagged = PollError::with_tag(
            DeliveryTag::new(),
            TriggerError::Poll {
                reason: "decode failed".into(),
            },
        );
        assert!(tagged.tag.is_some());
    }
}
