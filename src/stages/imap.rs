//! IMAP mailbox access.
//!
//! `fetch_new` surfaces unseen messages carrying a structured attachment;
//! `mark_consumed` flags a message `\Seen` so it is not redelivered.
//! Messages stay unseen until the pipeline has fully processed them — the
//! consume step runs as its own stage invocation after record handling.
//!
//! The IMAP client is hand-rolled over rustls. Sessions are short-lived
//! (one per call) and blocking, so all socket work runs under
//! `spawn_blocking`.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::ExposeSecret;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::error::StageError;
use crate::pipeline::types::{Attachment, MailMessage, MessageBatch, SeqNum};
use crate::stages::MailAccessor;

const STAGE_NAME: &str = "imap-mailbox";

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// IMAP-backed mailbox stage.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailAccessor for ImapMailbox {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    async fn fetch_new(&self) -> Result<Option<MessageBatch>, StageError> {
        let config = self.config.clone();
        let batch = tokio::task::spawn_blocking(move || fetch_unseen(&config))
            .await
            .map_err(|e| imap_err(format!("fetch task panicked: {e}")))??;

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    async fn mark_consumed(&self, seq: SeqNum) -> Result<(), StageError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.login(&config)?;
            session.select(&config.mailbox)?;
            session.mark_seen(seq)?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| imap_err(format!("consume task panicked: {e}")))?
    }
}

fn imap_err(reason: String) -> StageError {
    StageError::Failed {
        stage: STAGE_NAME.into(),
        reason,
    }
}

// ── Blocking session internals ──────────────────────────────────────

/// One poll cycle: fetch every unseen message with a matching attachment.
///
/// Messages that are not work items (blocked sender, no matching
/// attachment) are flagged `\Seen` immediately so they do not come back on
/// every poll.
fn fetch_unseen(config: &MailboxConfig) -> Result<MessageBatch, StageError> {
    let mut session = ImapSession::connect(config)?;
    session.login(config)?;
    session.select(&config.mailbox)?;

    let seqs = session.search_unseen()?;
    debug!(count = seqs.len(), "unseen messages in mailbox");

    let mut batch = MessageBatch::new();
    for seq in seqs {
        let raw = session.fetch_raw(seq)?;
        let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) else {
            warn!(seq, "unparseable message; leaving unseen");
            continue;
        };

        let sender = extract_sender(&parsed);
        if !sender_allowed(&config.allowed_senders, &sender) {
            warn!(seq, sender = %sender, "blocked sender; skipping message");
            session.mark_seen(seq)?;
            continue;
        }

        match find_attachment(&parsed, config.attachment_suffix.as_deref()) {
            Some(attachment) => {
                let message = MailMessage {
                    message_id: parsed
                        .message_id()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4())),
                    sender,
                    subject: parsed.subject().map(str::to_string),
                    received_at: message_date(&parsed),
                    attachment,
                };
                batch.insert(seq, message);
            }
            None => {
                debug!(seq, sender = %sender, "no matching attachment; skipping message");
                session.mark_seen(seq)?;
            }
        }
    }

    session.logout();
    Ok(batch)
}

/// A short-lived IMAP session over TLS.
struct ImapSession {
    stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    tag_counter: u32,
}

impl ImapSession {
    fn connect(config: &MailboxConfig) -> Result<Self, StageError> {
        let tcp = TcpStream::connect((&*config.host, config.port))
            .map_err(|e| imap_err(format!("could not connect to {}:{}: {e}", config.host, config.port)))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| imap_err(format!("could not set read timeout: {e}")))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = std::sync::Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.host.clone())
                .map_err(|e| imap_err(format!("invalid server name '{}': {e}", config.host)))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| imap_err(format!("could not start TLS session: {e}")))?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            tag_counter: 0,
        };
        session.read_line()?; // server greeting
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, StageError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.stream, &mut byte) {
                Ok(0) => return Err(imap_err("connection closed by server".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(imap_err(format!("read failed: {e}"))),
            }
        }
    }

    /// Send one command and collect response lines through the tagged
    /// completion line. `verb` is used in errors so credentials never leak
    /// into them.
    fn command(&mut self, verb: &str, cmd: &str) -> Result<Vec<String>, StageError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);

        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.stream, full.as_bytes())
            .map_err(|e| imap_err(format!("{verb}: write failed: {e}")))?;
        IoWrite::flush(&mut self.stream)
            .map_err(|e| imap_err(format!("{verb}: flush failed: {e}")))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }

        let completion = lines.last().map(String::as_str).unwrap_or_default();
        let status = completion.get(tag.len()..).unwrap_or_default().trim_start();
        if !status.starts_with("OK") {
            return Err(imap_err(format!("{verb} failed: {}", completion.trim_end())));
        }
        Ok(lines)
    }

    fn login(&mut self, config: &MailboxConfig) -> Result<(), StageError> {
        self.command(
            "LOGIN",
            &format!(
                "LOGIN \"{}\" \"{}\"",
                config.username,
                config.password.expose_secret()
            ),
        )?;
        Ok(())
    }

    fn select(&mut self, mailbox: &str) -> Result<(), StageError> {
        self.command("SELECT", &format!("SELECT \"{mailbox}\""))?;
        Ok(())
    }

    fn search_unseen(&mut self) -> Result<Vec<SeqNum>, StageError> {
        let lines = self.command("SEARCH", "SEARCH UNSEEN")?;
        Ok(parse_search_response(&lines))
    }

    fn fetch_raw(&mut self, seq: SeqNum) -> Result<String, StageError> {
        let lines = self.command("FETCH", &format!("FETCH {seq} RFC822"))?;
        Ok(assemble_fetch_body(&lines))
    }

    fn mark_seen(&mut self, seq: SeqNum) -> Result<(), StageError> {
        self.command("STORE", &format!("STORE {seq} +FLAGS (\\Seen)"))?;
        Ok(())
    }

    /// Best-effort logout; the session is gone either way.
    fn logout(mut self) {
        let _ = self.command("LOGOUT", "LOGOUT");
    }
}

// ── Response parsing helpers ────────────────────────────────────────

/// Pull sequence numbers out of `* SEARCH ...` response lines.
fn parse_search_response(lines: &[String]) -> Vec<SeqNum> {
    let mut seqs = Vec::new();
    for line in lines {
        if let Some(rest) = line.strip_prefix("* SEARCH") {
            seqs.extend(
                rest.split_whitespace()
                    .filter_map(|token| token.parse::<SeqNum>().ok()),
            );
        }
    }
    seqs
}

/// Strip the FETCH envelope (untagged intro line, tagged completion line)
/// and rebuild the raw message text.
fn assemble_fetch_body(lines: &[String]) -> String {
    lines
        .iter()
        .skip(1)
        .take(lines.len().saturating_sub(2))
        .cloned()
        .collect()
}

/// Sender allowlist check.
///
/// - empty list → no filtering (allow all)
/// - `*` → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact match
fn sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Extract the sender address from a parsed message.
fn extract_sender(parsed: &mail_parser::Message<'_>) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Find the first attachment whose filename matches `suffix`
/// (case-insensitive). `None` suffix accepts any attachment.
fn find_attachment(
    parsed: &mail_parser::Message<'_>,
    suffix: Option<&str>,
) -> Option<Attachment> {
    for part in parsed.attachments() {
        let filename = part.attachment_name().unwrap_or("attachment");
        let matches = match suffix {
            Some(suffix) => filename.to_lowercase().ends_with(&suffix.to_lowercase()),
            None => true,
        };
        if matches {
            return Some(Attachment {
                filename: filename.to_string(),
                content: part.contents().to_vec(),
            });
        }
    }
    None
}

/// Message date as UTC, falling back to "now" when the header is absent
/// or unrepresentable.
fn message_date(parsed: &mail_parser::Message<'_>) -> DateTime<Utc> {
    parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(d.year as i32, u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(
                        u32::from(d.hour),
                        u32::from(d.minute),
                        u32::from(d.second),
                    )
                })
                .map(|naive| naive.and_utc())
        })
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Allowlist ───────────────────────────────────────────────────

    #[test]
    fn empty_allowlist_allows_everyone() {
        assert!(sender_allowed(&[], "anyone@example.com"));
    }

    #[test]
    fn wildcard_allows_everyone() {
        let allowed = vec!["*".to_string()];
        assert!(sender_allowed(&allowed, "anyone@example.com"));
    }

    #[test]
    fn exact_email_match() {
        let allowed = vec!["orders@example.com".to_string()];
        assert!(sender_allowed(&allowed, "orders@example.com"));
        assert!(sender_allowed(&allowed, "Orders@Example.com"));
        assert!(!sender_allowed(&allowed, "other@example.com"));
    }

    #[test]
    fn domain_match_with_and_without_at() {
        let with_at = vec!["@example.com".to_string()];
        assert!(sender_allowed(&with_at, "a@example.com"));
        assert!(!sender_allowed(&with_at, "a@other.com"));

        let without_at = vec!["example.com".to_string()];
        assert!(sender_allowed(&without_at, "b@example.com"));
        assert!(!sender_allowed(&without_at, "b@other.com"));
    }

    // ── Response parsing ────────────────────────────────────────────

    #[test]
    fn parse_search_extracts_seq_numbers() {
        let lines = vec![
            "* SEARCH 3 5 17\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search_response(&lines), vec![3, 5, 17]);
    }

    #[test]
    fn parse_search_empty_result() {
        let lines = vec![
            "* SEARCH\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert!(parse_search_response(&lines).is_empty());
    }

    #[test]
    fn parse_search_skips_non_numeric_tokens() {
        let lines = vec!["* SEARCH 4 x 9\r\n".to_string()];
        assert_eq!(parse_search_response(&lines), vec![4, 9]);
    }

    #[test]
    fn assemble_fetch_strips_envelope() {
        let lines = vec![
            "* 5 FETCH (RFC822 {42}\r\n".to_string(),
            "From: a@b.c\r\n".to_string(),
            "\r\n".to_string(),
            "body\r\n".to_string(),
            "A4 OK FETCH completed\r\n".to_string(),
        ];
        let raw = assemble_fetch_body(&lines);
        assert!(raw.starts_with("From: a@b.c"));
        assert!(raw.contains("body"));
        assert!(!raw.contains("FETCH completed"));
    }

    // ── MIME handling ───────────────────────────────────────────────

    const SAMPLE_MAIL: &str = concat!(
        "From: orders@example.com\r\n",
        "To: pipeline@example.com\r\n",
        "Subject: daily export\r\n",
        "Message-ID: <abc@example.com>\r\n",
        "Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/mixed; boundary=\"b1\"\r\n",
        "\r\n",
        "--b1\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "See attached.\r\n",
        "--b1\r\n",
        "Content-Type: text/csv; name=\"export.csv\"\r\n",
        "Content-Disposition: attachment; filename=\"export.csv\"\r\n",
        "\r\n",
        "sku;qty\r\n",
        "A-1;3\r\n",
        "--b1--\r\n",
    );

    #[test]
    fn finds_attachment_by_suffix() {
        let parsed = MessageParser::default().parse(SAMPLE_MAIL.as_bytes()).unwrap();
        let attachment = find_attachment(&parsed, Some(".csv")).unwrap();
        assert_eq!(attachment.filename, "export.csv");
        let content = String::from_utf8(attachment.content).unwrap();
        assert!(content.contains("A-1;3"));
    }

    #[test]
    fn suffix_mismatch_finds_nothing() {
        let parsed = MessageParser::default().parse(SAMPLE_MAIL.as_bytes()).unwrap();
        assert!(find_attachment(&parsed, Some(".xml")).is_none());
    }

    #[test]
    fn no_suffix_accepts_any_attachment() {
        let parsed = MessageParser::default().parse(SAMPLE_MAIL.as_bytes()).unwrap();
        assert!(find_attachment(&parsed, None).is_some());
    }

    #[test]
    fn extracts_sender_and_date() {
        let parsed = MessageParser::default().parse(SAMPLE_MAIL.as_bytes()).unwrap();
        assert_eq!(extract_sender(&parsed), "orders@example.com");

        let date = message_date(&parsed);
        assert_eq!(date.to_rfc3339(), "2025-07-01T10:00:00+00:00");
    }
}
