//! Pipeline lifecycle and the orchestration loop.
//!
//! `Pipeline::start` initializes the trigger, spawns the loop as one
//! background task, and returns immediately. The loop serializes delivery
//! attempts: it never polls again before the prior tag is acknowledged,
//! so at most one tag is ever outstanding. A stop flag is observed
//! non-blockingly at the top of each iteration; in-flight stage work is
//! never cancelled, only bounded by per-stage timeouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::MailflowConfig;
use crate::error::{ConfigError, Error, PipelineError};
use crate::pipeline::handler::MessageHandler;
use crate::stages::{invoke, MailAccessor, StageSet};
use crate::trigger::{DeliveryTag, Outcome, Trigger};

/// An assembled pipeline, ready to start.
///
/// Owns its trigger and stages. `start` consumes the pipeline; restarting
/// means assembling a new one, which re-initializes the trigger from the
/// top.
pub struct Pipeline {
    config: MailflowConfig,
    trigger: Box<dyn Trigger>,
    stages: StageSet,
}

impl Pipeline {
    pub fn new(config: MailflowConfig, trigger: Box<dyn Trigger>, stages: StageSet) -> Self {
        Self {
            config,
            trigger,
            stages,
        }
    }

    /// Initialize the trigger and spawn the background loop.
    ///
    /// Returns as soon as the loop is running. A trigger init failure is
    /// fatal: no loop is started and the error is returned to the caller.
    pub async fn start(mut self) -> Result<PipelineHandle, Error> {
        let blob = serde_json::to_vec(&self.config.trigger)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        self.trigger.init(&blob).await?;
        info!("initialized pipeline trigger");

        let handler = MessageHandler::new(
            self.stages.clone(),
            self.config.templater.variables.clone(),
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let mailbox = Arc::clone(&self.stages.mailbox);
        let trigger = self.trigger;

        let handle = tokio::spawn(async move {
            run_loop(trigger, mailbox, handler, flag).await;
        });

        Ok(PipelineHandle { handle, shutdown })
    }
}

/// Handle to a running pipeline loop.
#[derive(Debug)]
pub struct PipelineHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// Request graceful shutdown. The loop exits before its next poll;
    /// an in-flight delivery finishes (and is acknowledged) first.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop task to exit.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.handle.await
    }
}

/// The orchestration loop: poll → fetch → handle → acknowledge, forever.
///
/// Processing errors never terminate the loop; only the stop flag does.
async fn run_loop(
    trigger: Box<dyn Trigger>,
    mailbox: Arc<dyn MailAccessor>,
    handler: MessageHandler,
    shutdown: Arc<AtomicBool>,
) {
    info!("pipeline loop started");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("pipeline loop stopping");
            return;
        }

        let delivery = match trigger.next_message().await {
            Ok(delivery) => delivery,
            Err(poll_err) => {
                // Transient: report and retry on the next iteration. If
                // the failed poll still produced a tag, it must be closed
                // out like any other delivery.
                error!(error = %poll_err.source, "trigger poll failed");
                if let Some(tag) = poll_err.tag {
                    respond(trigger.as_ref(), tag, Outcome::Failed(poll_err.source.into())).await;
                }
                continue;
            }
        };
        debug!(tag = %delivery.tag, "next delivery");

        let batch = match invoke(
            mailbox.name(),
            mailbox.invoke_timeout(),
            mailbox.fetch_new(),
        )
        .await
        {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                debug!(tag = %delivery.tag, "no new messages");
                respond(trigger.as_ref(), delivery.tag, Outcome::Consumed).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "mailbox check failed");
                let failure = PipelineError::Fetch { source: e };
                respond(trigger.as_ref(), delivery.tag, Outcome::Failed(failure.into())).await;
                continue;
            }
        };

        info!(count = batch.len(), "fetched new messages");

        let outcome = match handler.handle_messages(&batch).await {
            Ok(()) => Outcome::Consumed,
            Err(failure) => {
                error!(seq = failure.seq, error = %failure, "message handling failed");
                Outcome::Failed(failure.into())
            }
        };
        respond(trigger.as_ref(), delivery.tag, outcome).await;
    }
}

/// Acknowledge a delivery, logging (but not propagating) respond failures
/// so the loop keeps running.
async fn respond(trigger: &dyn Trigger, tag: DeliveryTag, outcome: Outcome) {
    let label = outcome.label();
    if let Err(e) = trigger.respond(tag, outcome).await {
        error!(error = %e, outcome = label, "failed to acknowledge delivery");
    }
}
