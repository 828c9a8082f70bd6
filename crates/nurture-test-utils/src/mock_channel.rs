// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock channel adapter for deterministic testing.
//!
//! `MockChannel` implements `ChannelAdapter`, capturing delivered messages
//! for assertion and failing or stalling on demand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use nurture_core::NurtureError;
use nurture_core::traits::adapter::PluginAdapter;
use nurture_core::traits::channel::ChannelAdapter;
use nurture_core::types::{AdapterType, HealthStatus, MessageId, OutboundMessage};

#[derive(Default)]
struct Script {
    failures_remaining: u32,
    delay: Option<Duration>,
}

/// A mock delivery channel for testing.
///
/// Successful sends are captured and retrievable via `sent_messages()`.
/// `fail_next(n)` makes the next `n` sends return a channel error;
/// `set_delay(d)` makes every send sleep for `d` first.
pub struct MockChannel {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    script: Arc<Mutex<Script>>,
}

impl MockChannel {
    /// Create a new mock channel that accepts everything.
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Fail the next `count` sends with a channel error.
    pub async fn fail_next(&self, count: u32) {
        self.script.lock().await.failures_remaining = count;
    }

    /// Sleep this long in every send before answering.
    pub async fn set_delay(&self, delay: Duration) {
        self.script.lock().await.delay = Some(delay);
    }

    /// Get all messages that were delivered through `send()`.
    pub async fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }

    /// Get the count of delivered messages.
    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Clear all captured messages.
    pub async fn clear_sent(&self) {
        self.sent.lock().await.clear();
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginAdapter for MockChannel {
    fn name(&self) -> &str {
        "mock-channel"
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
impl ChannelAdapter for MockChannel {
    async fn send(&self, msg: OutboundMessage) -> Result<MessageId, NurtureError> {
        let delay = self.script.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut script = self.script.lock().await;
            if script.failures_remaining > 0 {
                script.failures_remaining -= 1;
                return Err(NurtureError::Channel {
                    message: format!("scripted failure for message {}", msg.queue_id),
                    source: None,
                });
            }
        }

        let id = format!("mock-msg-{}", uuid::Uuid::new_v4());
        self.sent.lock().await.push(msg);
        Ok(MessageId(id))
    }
}

#[cfg(test)]
mod tests {
    use nurture_core::Channel;

    use super::*;

    fn outbound(queue_id: i64) -> OutboundMessage {
        OutboundMessage {
            queue_id,
            attempt: 1,
            channel: Channel::Chat,
            channel_user_id: "chat-u1".into(),
            content: "hello".into(),
        }
    }

    #[tokio::test]
    async fn send_captures_messages() {
        let channel = MockChannel::new();
        let id = channel.send(outbound(1)).await.unwrap();
        assert!(id.0.starts_with("mock-msg-"));
        assert_eq!(channel.sent_count().await, 1);
        assert_eq!(channel.sent_messages().await[0].queue_id, 1);

        channel.clear_sent().await;
        assert_eq!(channel.sent_count().await, 0);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let channel = MockChannel::new();
        channel.fail_next(2).await;
        assert!(channel.send(outbound(1)).await.is_err());
        let err = channel.send(outbound(1)).await.unwrap_err();
        assert!(err.to_string().contains("scripted failure"));
        assert!(channel.send(outbound(1)).await.is_ok());
        assert_eq!(channel.sent_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_holds_the_send() {
        let channel = MockChannel::new();
        channel.set_delay(Duration::from_secs(30)).await;
        let started = tokio::time::Instant::now();
        channel.send(outbound(1)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
