//! Schedule-based poll trigger.
//!
//! Fires a delivery at every match of a cron expression. Acknowledgments
//! are logged and otherwise dropped: redelivery is implicit, because
//! messages a failed batch left unconsumed are still unseen at the source
//! and will be part of the next fire's fetch.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::TriggerError;
use crate::trigger::{Delivery, DeliveryTag, Outcome, PollError, Trigger};

/// Cron trigger configuration blob.
#[derive(Debug, Deserialize)]
struct CronConfig {
    /// Cron expression with a seconds field, e.g. `0 */5 * * * *` for
    /// every five minutes.
    schedule: String,
}

/// Fires on a cron schedule.
pub struct CronTrigger {
    schedule: Option<Schedule>,
}

impl CronTrigger {
    pub fn new() -> Self {
        Self { schedule: None }
    }
}

impl Default for CronTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Trigger for CronTrigger {
    async fn init(&mut self, config: &[u8]) -> Result<(), TriggerError> {
        let config: CronConfig =
            serde_json::from_slice(config).map_err(|e| TriggerError::Init {
                reason: format!("could not parse cron trigger config: {e}"),
            })?;

        let schedule = Schedule::from_str(&config.schedule).map_err(|e| TriggerError::Init {
            reason: format!("invalid cron expression '{}': {e}", config.schedule),
        })?;

        debug!(schedule = %config.schedule, "cron trigger initialized");
        self.schedule = Some(schedule);
        Ok(())
    }

    async fn next_message(&self) -> Result<Delivery, PollError> {
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| PollError::new(TriggerError::NotInitialized))?;

        let fire_at = schedule.upcoming(Utc).next().ok_or_else(|| {
            PollError::new(TriggerError::Poll {
                reason: "schedule has no upcoming fire times".into(),
            })
        })?;

        let wait = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        Ok(Delivery {
            tag: DeliveryTag::new(),
            payload: serde_json::json!({ "fired_at": fire_at.to_rfc3339() }),
        })
    }

    async fn respond(&self, tag: DeliveryTag, outcome: Outcome) -> Result<(), TriggerError> {
        match outcome {
            Outcome::Consumed => debug!(tag = %tag, "delivery consumed"),
            Outcome::Failed(e) => {
                warn!(tag = %tag, error = %e, "delivery failed; unconsumed messages redeliver on the next fire");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_rejects_invalid_json() {
        let mut trigger = CronTrigger::new();
        let err = trigger.init(b"{not json").await.unwrap_err();
        assert!(matches!(err, TriggerError::Init { .. }));
    }

    #[tokio::test]
    async fn init_rejects_invalid_expression() {
        let mut trigger = CronTrigger::new();
        let err = trigger
            .init(br#"{"schedule": "every day at noon"}"#)
            .await
            .unwrap_err();
        match err {
            TriggerError::Init { reason } => assert!(reason.contains("every day at noon")),
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn next_message_before_init_fails_without_tag() {
        let trigger = CronTrigger::new();
        let err = trigger.next_message().await.unwrap_err();
        assert!(err.tag.is_none());
        assert!(matches!(err.source, TriggerError::NotInitialized));
    }

    #[tokio::test]
    async fn next_message_fires_on_schedule() {
        let mut trigger = CronTrigger::new();
        trigger
            .init(br#"{"schedule": "* * * * * *"}"#)
            .await
            .unwrap();

        // An every-second schedule must fire within a couple of seconds.
        let delivery = tokio::time::timeout(Duration::from_secs(3), trigger.next_message())
            .await
            .expect("schedule did not fire in time")
            .unwrap();

        assert!(delivery.payload["fired_at"].is_string());
    }

    #[tokio::test]
    async fn respond_accepts_both_outcomes() {
        let mut trigger = CronTrigger::new();
        trigger
            .init(br#"{"schedule": "* * * * * *"}"#)
            .await
            .unwrap();

        trigger
            .respond(DeliveryTag::new(), Outcome::Consumed)
            .await
            .unwrap();
        trigger
            .respond(
                DeliveryTag::new(),
                Outcome::Failed(crate::error::Error::Trigger(TriggerError::Closed)),
            )
            .await
            .unwrap();
    }
}
