//! HTTP delivery stage.
//!
//! Forwards each rendered record to the configured sink URL. A non-2xx
//! response is a delivery failure; retry happens through redelivery of the
//! whole message, not here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::DeliveryConfig;
use crate::error::{ConfigError, StageError};
use crate::stages::Deliverer;

const STAGE_NAME: &str = "http-deliverer";

/// Request timeout at the HTTP client level, below the stage timeout so
/// network stalls produce a delivery error rather than a stage timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Delivers rendered output to an HTTP sink.
#[derive(Debug)]
pub struct HttpDeliverer {
    client: reqwest::Client,
    method: reqwest::Method,
    config: DeliveryConfig,
}

impl HttpDeliverer {
    pub fn new(config: DeliveryConfig) -> Result<Self, ConfigError> {
        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|e| ConfigError::InvalidValue {
                key: "delivery.method".into(),
                message: e.to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "delivery".into(),
                message: format!("could not build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            method,
            config,
        })
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    async fn deliver(&self, body: &str) -> Result<(), StageError> {
        let mut request = self
            .client
            .request(self.method.clone(), &self.config.url)
            .header(CONTENT_TYPE, &self.config.content_type)
            .body(body.to_string());

        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| StageError::Failed {
            stage: STAGE_NAME.into(),
            reason: format!("request to sink failed: {e}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StageError::Failed {
                stage: STAGE_NAME.into(),
                reason: format!("sink returned {status}"),
            });
        }

        debug!(status = %status, "record delivered to sink");
        Ok(())
    }
}
