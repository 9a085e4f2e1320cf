//! Batch and record handling — the per-delivery processing core.
//!
//! Fail-fast at both levels: the first failing message aborts the batch,
//! and the first failing record aborts its message. Whatever was not
//! reached stays unconsumed at the source and arrives again with the next
//! delivery.

use tracing::debug;

use crate::config::VariableMapping;
use crate::error::{BatchFailure, PipelineError};
use crate::pipeline::types::{MessageBatch, Record, TemplateVars};
use crate::stages::{invoke, StageSet};

/// Drives one batch through extract → per-record render/deliver → consume.
pub struct MessageHandler {
    stages: StageSet,
    variables: Vec<VariableMapping>,
}

impl MessageHandler {
    pub fn new(stages: StageSet, variables: Vec<VariableMapping>) -> Self {
        Self { stages, variables }
    }

    /// Work through one batch.
    ///
    /// Iteration order is the batch's own (unordered) order. The first
    /// error stops iteration and comes back tagged with the sequence
    /// number being processed; messages not yet reached are left for
    /// redelivery. An empty batch succeeds without any stage invocation.
    pub async fn handle_messages(&self, batch: &MessageBatch) -> Result<(), BatchFailure> {
        for (&seq, message) in batch.iter() {
            debug!(seq, message_id = %message.message_id, "processing message");

            let extractor = &self.stages.extractor;
            let records = invoke(
                extractor.name(),
                extractor.invoke_timeout(),
                extractor.extract(message),
            )
            .await
            .map_err(|source| BatchFailure {
                seq,
                source: PipelineError::Extract { source },
            })?;

            debug!(seq, count = records.len(), "extracted records");

            self.handle_records(&records)
                .await
                .map_err(|source| BatchFailure { seq, source })?;

            // Only a fully delivered message is consumed at the source.
            let mailbox = &self.stages.mailbox;
            invoke(
                mailbox.name(),
                mailbox.invoke_timeout(),
                mailbox.mark_consumed(seq),
            )
            .await
            .map_err(|source| BatchFailure {
                seq,
                source: PipelineError::MarkConsumed { source },
            })?;

            debug!(seq, "message consumed");
        }

        Ok(())
    }

    /// Render and deliver each record in order.
    ///
    /// The first error aborts the remaining records and is tagged with the
    /// failing record's index.
    async fn handle_records(&self, records: &[Record]) -> Result<(), PipelineError> {
        for (index, record) in records.iter().enumerate() {
            let vars = project_variables(record, &self.variables)
                .map_err(|reason| PipelineError::Projection { index, reason })?;

            let renderer = &self.stages.renderer;
            let rendered = invoke(
                renderer.name(),
                renderer.invoke_timeout(),
                renderer.render(&vars),
            )
            .await
            .map_err(|source| PipelineError::Render { index, source })?;

            let deliverer = &self.stages.deliverer;
            invoke(
                deliverer.name(),
                deliverer.invoke_timeout(),
                deliverer.deliver(&rendered),
            )
            .await
            .map_err(|source| PipelineError::Deliver { index, source })?;

            debug!(index, "record delivered");
        }

        Ok(())
    }
}

/// Project the declared variable set out of a record.
///
/// Every declared variable must resolve to a scalar; an absent path or a
/// structured value is an error, not a silent default.
pub fn project_variables(
    record: &Record,
    mappings: &[VariableMapping],
) -> Result<TemplateVars, String> {
    let mut vars = TemplateVars::new();
    for mapping in mappings {
        let value = record.lookup(&mapping.path).ok_or_else(|| {
            format!(
                "no value at path '{}' for variable '{}'",
                mapping.path, mapping.name
            )
        })?;
        let text = scalar_to_string(value).ok_or_else(|| {
            format!(
                "value at path '{}' for variable '{}' is not a scalar",
                mapping.path, mapping.name
            )
        })?;
        vars.insert(mapping.name.clone(), text);
    }
    Ok(vars)
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Null => Some(String::new()),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
    }
}
