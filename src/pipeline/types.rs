//! Core data model for the pipeline.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable per-item position within a batch, assigned by the upstream
/// source. Unique within a batch; not contiguous or ascending across
/// batches.
pub type SeqNum = u32;

/// Variables projected out of a record, keyed by template placeholder name.
pub type TemplateVars = BTreeMap<String, String>;

/// A structured file attached to a message — the raw material records are
/// extracted from.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// One inbound message surfaced by the mailbox.
#[derive(Debug, Clone)]
pub struct MailMessage {
    /// Source-native message identifier (e.g. the Message-ID header).
    pub message_id: String,
    pub sender: String,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub attachment: Attachment,
}

/// One delivery's set of messages, keyed by sequence number.
///
/// Iteration order is unspecified: the upstream source hands over an
/// unordered mapping, and the handler processes it as such. Redelivery
/// does not depend on order — a failed batch is re-fetched whole, since
/// unconsumed messages stay unseen at the source.
#[derive(Debug, Default)]
pub struct MessageBatch {
    messages: HashMap<SeqNum, MailMessage>,
}

impl MessageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message under its sequence number. Returns the previous
    /// message if `seq` was already present (the source violated the
    /// uniqueness invariant).
    pub fn insert(&mut self, seq: SeqNum, message: MailMessage) -> Option<MailMessage> {
        self.messages.insert(seq, message)
    }

    pub fn get(&self, seq: SeqNum) -> Option<&MailMessage> {
        self.messages.get(&seq)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Iterate messages in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&SeqNum, &MailMessage)> {
        self.messages.iter()
    }
}

/// One structured unit extracted from a message attachment.
///
/// Records are ephemeral: created during message handling, consumed by the
/// render/deliver stages, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record(serde_json::Value);

impl Record {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Resolve a dotted path (`customer.address.city`) against the record.
    ///
    /// Returns `None` when any path segment is absent or the intermediate
    /// value is not an object.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        let mut current = &self.0;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}
