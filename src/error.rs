//! Error types for mailflow.

use std::time::Duration;

use crate::pipeline::types::SeqNum;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Batch failure: {0}")]
    Batch(#[from] BatchFailure),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trigger-related errors.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Trigger init failed: {reason}")]
    Init { reason: String },

    #[error("Trigger not initialized (init was never called or failed)")]
    NotInitialized,

    #[error("Poll failed: {reason}")]
    Poll { reason: String },

    #[error("Acknowledge failed: {reason}")]
    Respond { reason: String },

    #[error("Trigger source closed")]
    Closed,
}

/// Errors surfaced by a stage invocation.
///
/// Contract violations (malformed stage output, missing fields) are values
/// of this type, not panics — the loop treats them exactly like a failure
/// the stage reported itself.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{stage}: invalid input: {reason}")]
    InvalidInput { stage: String, reason: String },

    #[error("{stage}: {reason}")]
    Failed { stage: String, reason: String },

    #[error("{stage}: malformed output: {reason}")]
    MalformedOutput { stage: String, reason: String },

    #[error("{stage} timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },
}

/// Message- and record-level processing errors, tagged with the position
/// of the unit being processed when the stage failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("could not check mailbox for new messages: {source}")]
    Fetch {
        #[source]
        source: StageError,
    },

    #[error("could not extract records from attachment: {source}")]
    Extract {
        #[source]
        source: StageError,
    },

    #[error("record {index}: could not project template variables: {reason}")]
    Projection { index: usize, reason: String },

    #[error("record {index}: could not render template: {source}")]
    Render {
        index: usize,
        #[source]
        source: StageError,
    },

    #[error("record {index}: could not deliver rendered output: {source}")]
    Deliver {
        index: usize,
        #[source]
        source: StageError,
    },

    #[error("could not mark message consumed: {source}")]
    MarkConsumed {
        #[source]
        source: StageError,
    },
}

/// A batch stopped at its first failing message.
///
/// `seq` is the sequence number being processed when the failure occurred.
/// An error-free batch never produces this value, so "no progress to
/// report" needs no sentinel.
#[derive(Debug, thiserror::Error)]
#[error("message {seq}: {source}")]
pub struct BatchFailure {
    pub seq: SeqNum,
    #[source]
    pub source: PipelineError,
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
