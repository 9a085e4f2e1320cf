//! Delimited-attachment extractor.
//!
//! Parses a delimiter-separated text attachment (one record per line) into
//! records. With a header row, fields are named by the header; without
//! one, by column position.

use async_trait::async_trait;

use crate::config::ExtractorConfig;
use crate::error::StageError;
use crate::pipeline::types::{MailMessage, Record};
use crate::stages::Extractor;

const STAGE_NAME: &str = "delimited-extractor";

/// Extracts records from delimiter-separated attachments.
pub struct DelimitedExtractor {
    config: ExtractorConfig,
}

impl DelimitedExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Extractor for DelimitedExtractor {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    async fn extract(&self, message: &MailMessage) -> Result<Vec<Record>, StageError> {
        parse_delimited(
            &message.attachment.content,
            self.config.delimiter,
            self.config.has_header,
        )
    }
}

/// Parse delimited text into records.
///
/// Empty lines are skipped; a data row whose field count differs from the
/// header's is a contract error, not a silent truncation.
fn parse_delimited(
    content: &[u8],
    delimiter: char,
    has_header: bool,
) -> Result<Vec<Record>, StageError> {
    let text = std::str::from_utf8(content).map_err(|e| StageError::InvalidInput {
        stage: STAGE_NAME.into(),
        reason: format!("attachment is not valid UTF-8: {e}"),
    })?;

    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let header: Option<Vec<String>> = if has_header {
        match lines.next() {
            Some(line) => Some(split_fields(line, delimiter)),
            // A header-only contract with an empty file: no records.
            None => return Ok(Vec::new()),
        }
    } else {
        None
    };

    let mut records = Vec::new();
    for (row, line) in lines.enumerate() {
        let fields = split_fields(line, delimiter);

        let names: Vec<String> = match &header {
            Some(names) => {
                if fields.len() != names.len() {
                    return Err(StageError::MalformedOutput {
                        stage: STAGE_NAME.into(),
                        reason: format!(
                            "row {row}: expected {} fields, got {}",
                            names.len(),
                            fields.len()
                        ),
                    });
                }
                names.clone()
            }
            None => (0..fields.len()).map(|i| format!("col{i}")).collect(),
        };

        let mut object = serde_json::Map::new();
        for (name, value) in names.into_iter().zip(fields) {
            object.insert(name, serde_json::Value::String(value));
        }
        records.push(Record::new(serde_json::Value::Object(object)));
    }

    Ok(records)
}

fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    line.split(delimiter)
        .map(|field| field.trim().to_string())
        .collect()
}
