// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Webhook delivery channel.
//!
//! POSTs each rendered message as JSON to a configured endpoint. Every
//! request carries an `Idempotency-Key` derived from the queue row id, so a
//! receiver can drop the duplicate that follows an expired claim. Retries are
//! left to the delivery worker; a failed request is reported once.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use nurture_config::model::ChannelConfig;
use nurture_core::NurtureError;
use nurture_core::traits::adapter::PluginAdapter;
use nurture_core::traits::channel::ChannelAdapter;
use nurture_core::types::{AdapterType, HealthStatus, MessageId, OutboundMessage};

/// Header carrying the delivery attempt number.
const ATTEMPT_HEADER: &str = "x-nurture-attempt";

#[derive(Debug, Deserialize)]
struct WebhookReceipt {
    #[serde(default)]
    message_id: Option<String>,
}

/// Channel adapter that delivers messages to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    /// Build the channel from `[channel]` configuration.
    ///
    /// Fails when no webhook URL is configured or the auth token is not a
    /// valid header value.
    pub fn new(config: &ChannelConfig) -> Result<Self, NurtureError> {
        let url = config
            .webhook_url
            .clone()
            .ok_or_else(|| NurtureError::Config("channel.webhook_url is not set".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        if let Some(token) = &config.auth_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                NurtureError::Config(format!("invalid channel.auth_token header value: {e}"))
            })?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| NurtureError::Channel {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(Box::new(e)),
            })?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Idempotency key of a queue row; stable across attempts.
pub fn idempotency_key(queue_id: i64) -> String {
    format!("nurture-{queue_id}")
}

#[async_trait]
impl PluginAdapter for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(0, 1, 0)
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Channel
    }

    async fn health_check(&self) -> Result<HealthStatus, NurtureError> {
        Ok(HealthStatus::Healthy)
    }

    async fn shutdown(&self) -> Result<(), NurtureError> {
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    async fn send(&self, msg: OutboundMessage) -> Result<MessageId, NurtureError> {
        let queue_id = msg.queue_id;
        let response = self
            .client
            .post(&self.url)
            .header("idempotency-key", idempotency_key(queue_id))
            .header(ATTEMPT_HEADER, msg.attempt.to_string())
            .json(&msg)
            .send()
            .await
            .map_err(|e| NurtureError::Channel {
                message: format!("webhook request failed: {e}"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(queue_id, status = %status, "webhook response received");

        if !status.is_success() {
            return Err(NurtureError::Channel {
                message: format!("webhook returned {status}: {body}"),
                source: None,
            });
        }

        // An empty or non-JSON success body is still a delivery.
        let receipt = serde_json::from_str::<WebhookReceipt>(&body)
            .ok()
            .and_then(|r| r.message_id);
        Ok(MessageId(
            receipt.unwrap_or_else(|| idempotency_key(queue_id)),
        ))
    }
}
