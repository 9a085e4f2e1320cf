//! Stage contracts the orchestrator invokes.
//!
//! One trait per stage kind, with typed inputs and outputs. Adapters own
//! their configuration (constructed once, read-only) so the orchestrator
//! passes only the work item. Side effects — mailbox mutation, network
//! calls — are entirely the adapter's business; the core sees only the
//! returned value or error.

pub mod delimited;
pub mod http;
pub mod imap;
pub mod templater;

pub use delimited::DelimitedExtractor;
pub use http::HttpDeliverer;
pub use imap::ImapMailbox;
pub use templater::TemplateRenderer;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StageError;
use crate::pipeline::types::{MailMessage, MessageBatch, Record, SeqNum, TemplateVars};

/// Default time budget for one stage invocation.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox access: surfaces new message batches and consumes handled
/// messages at the source.
#[async_trait]
pub trait MailAccessor: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_timeout(&self) -> Duration {
        DEFAULT_INVOKE_TIMEOUT
    }

    /// Check for newly arrived messages. `None` means the mailbox has
    /// nothing new.
    async fn fetch_new(&self) -> Result<Option<MessageBatch>, StageError>;

    /// Mark the message at `seq` consumed so it is not redelivered.
    async fn mark_consumed(&self, seq: SeqNum) -> Result<(), StageError>;
}

/// Expands one message's attachment into an ordered sequence of records.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_timeout(&self) -> Duration {
        DEFAULT_INVOKE_TIMEOUT
    }

    async fn extract(&self, message: &MailMessage) -> Result<Vec<Record>, StageError>;
}

/// Renders one record's projected variables through the configured
/// template.
#[async_trait]
pub trait Renderer: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_timeout(&self) -> Duration {
        DEFAULT_INVOKE_TIMEOUT
    }

    async fn render(&self, vars: &TemplateVars) -> Result<String, StageError>;
}

/// Forwards rendered output to the downstream sink.
#[async_trait]
pub trait Deliverer: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_timeout(&self) -> Duration {
        DEFAULT_INVOKE_TIMEOUT
    }

    async fn deliver(&self, body: &str) -> Result<(), StageError>;
}

/// Shared stage handles, one per stage kind.
#[derive(Clone)]
pub struct StageSet {
    pub mailbox: Arc<dyn MailAccessor>,
    pub extractor: Arc<dyn Extractor>,
    pub renderer: Arc<dyn Renderer>,
    pub deliverer: Arc<dyn Deliverer>,
}

/// Await a stage invocation under its time budget.
///
/// A stage that never returns surfaces as `StageError::Timeout` instead of
/// blocking the loop forever.
pub(crate) async fn invoke<T, F>(stage: &str, timeout: Duration, fut: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>> + Send,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StageError::Timeout {
            stage: stage.to_string(),
            timeout,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invoke_passes_through_success() {
        let result = invoke("test-stage", Duration::from_secs(1), async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn invoke_passes_through_stage_error() {
        let result: Result<(), StageError> = invoke("test-stage", Duration::from_secs(1), async {
            Err(StageError::Failed {
                stage: "test-stage".into(),
                reason: "boom".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(StageError::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_times_out_hung_stage() {
        let result: Result<(), StageError> =
            invoke("slow-stage", Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        match result {
            Err(StageError::Timeout { stage, timeout }) => {
                assert_eq!(stage, "slow-stage");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
