//! Orchestration core.
//!
//! One delivery flows through:
//! 1. `Trigger::next_message()` — wait for the next unit of work
//! 2. `MailAccessor::fetch_new()` — check the mailbox for a batch
//! 3. `MessageHandler::handle_messages()` — extract → render → deliver,
//!    then mark each message consumed
//! 4. `Trigger::respond()` — acknowledge the delivery exactly once
//!
//! Failures abort the current batch fail-fast and ride back up inside the
//! acknowledgment; unconsumed messages are redelivered on the next poll.

pub mod engine;
pub mod handler;
pub mod types;

pub use engine::{Pipeline, PipelineHandle};
pub use handler::MessageHandler;
pub use types::{Attachment, MailMessage, MessageBatch, Record, SeqNum, TemplateVars};
