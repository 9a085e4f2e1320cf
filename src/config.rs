//! Configuration types.
//!
//! Loaded once from a JSON file before the pipeline starts and read-only
//! afterwards. Secrets (mailbox password, sink token) can be supplied via
//! environment variables instead of the file.

use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable overriding `mailbox.password`.
pub const ENV_IMAP_PASSWORD: &str = "MAILFLOW_IMAP_PASSWORD";

/// Environment variable overriding `delivery.auth_token`.
pub const ENV_SINK_TOKEN: &str = "MAILFLOW_SINK_TOKEN";

/// Full pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MailflowConfig {
    /// Opaque trigger configuration, handed verbatim to `Trigger::init`.
    /// The core never inspects it.
    #[serde(default)]
    pub trigger: serde_json::Value,
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    pub templater: TemplaterConfig,
    pub delivery: DeliveryConfig,
}

impl MailflowConfig {
    /// Load configuration from a JSON file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Ok(password) = std::env::var(ENV_IMAP_PASSWORD) {
            config.mailbox.password = SecretString::from(password);
        }
        if let Ok(token) = std::env::var(ENV_SINK_TOKEN) {
            config.delivery.auth_token = Some(SecretString::from(token));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox.host.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "mailbox.host".into(),
                hint: "Set the IMAP server hostname.".into(),
            });
        }
        if self.templater.template.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "templater.template".into(),
                hint: "Provide the template body rendered for each record.".into(),
            });
        }
        if self.delivery.url.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "delivery.url".into(),
                hint: "Set the downstream sink URL.".into(),
            });
        }
        Ok(())
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP mailbox access configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: SecretString,
    /// Mailbox to poll.
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Sender allowlist. Empty means no filtering.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    /// Only attachments whose filename ends with this suffix are work
    /// items (e.g. ".csv"). `None` accepts any attachment.
    #[serde(default)]
    pub attachment_suffix: Option<String>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_password() -> SecretString {
    SecretString::from(String::new())
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

// ── Extractor ───────────────────────────────────────────────────────

/// Delimited-attachment extraction configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Whether the first row names the record fields. Without a header,
    /// fields are named by column position (`col0`, `col1`, ...).
    #[serde(default = "default_has_header")]
    pub has_header: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            has_header: default_has_header(),
        }
    }
}

fn default_delimiter() -> char {
    ';'
}

fn default_has_header() -> bool {
    true
}

// ── Templater ───────────────────────────────────────────────────────

/// Template rendering configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplaterConfig {
    /// Template body with `{{variable}}` placeholders.
    pub template: String,
    /// Declared variable set: each rendered record must supply a value
    /// for every entry.
    #[serde(default)]
    pub variables: Vec<VariableMapping>,
}

/// One declared template variable and where to find it in a record.
#[derive(Debug, Clone, Deserialize)]
pub struct VariableMapping {
    /// Placeholder name in the template.
    pub name: String,
    /// Dotted lookup path into the record (e.g. `customer.email`).
    pub path: String,
}

// ── Delivery ────────────────────────────────────────────────────────

/// Downstream sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Optional bearer token for the sink.
    #[serde(default)]
    pub auth_token: Option<SecretString>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"{
        "trigger": {"schedule": "0 */5 * * * *"},
        "mailbox": {"host": "imap.example.com", "username": "orders"},
        "templater": {
            "template": "{\"sku\": \"{{sku}}\"}",
            "variables": [{"name": "sku", "path": "sku"}]
        },
        "delivery": {"url": "https://sink.example.com/import"}
    }"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_minimal_applies_defaults() {
        let file = write_config(MINIMAL);
        let config = MailflowConfig::load(file.path()).unwrap();

        assert_eq!(config.mailbox.port, 993);
        assert_eq!(config.mailbox.mailbox, "INBOX");
        assert!(config.mailbox.allowed_senders.is_empty());
        assert_eq!(config.extractor.delimiter, ';');
        assert!(config.extractor.has_header);
        assert_eq!(config.delivery.method, "POST");
        assert_eq!(config.delivery.content_type, "application/json");
        assert!(config.delivery.auth_token.is_none());
    }

    #[test]
    fn load_keeps_trigger_blob_opaque() {
        let file = write_config(MINIMAL);
        let config = MailflowConfig::load(file.path()).unwrap();
        assert_eq!(config.trigger["schedule"], "0 */5 * * * *");
    }

    #[test]
    fn load_rejects_invalid_json() {
        let file = write_config("{not json");
        let err = MailflowConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = MailflowConfig::load(Path::new("/nonexistent/mailflow.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn validate_rejects_empty_host() {
        let file = write_config(&MINIMAL.replace("imap.example.com", ""));
        let err = MailflowConfig::load(file.path()).unwrap_err();
        match err {
            ConfigError::MissingRequired { key, .. } => assert_eq!(key, "mailbox.host"),
            other => panic!("expected MissingRequired, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_empty_sink_url() {
        let file = write_config(&MINIMAL.replace("https://sink.example.com/import", ""));
        let err = MailflowConfig::load(file.path()).unwrap_err();
        match err {
            ConfigError::MissingRequired { key, .. } => assert_eq!(key, "delivery.url"),
            other => panic!("expected MissingRequired, got {other:?}"),
        }
    }

    #[test]
    fn env_overrides_password() {
        use secrecy::ExposeSecret;

        // SAFETY: test-local env mutation; no other thread reads this var.
        unsafe { std::env::set_var(ENV_IMAP_PASSWORD, "s3cret") };
        let file = write_config(MINIMAL);
        let config = MailflowConfig::load(file.path()).unwrap();
        unsafe { std::env::remove_var(ENV_IMAP_PASSWORD) };

        assert_eq!(config.mailbox.password.expose_secret(), "s3cret");
    }
}
