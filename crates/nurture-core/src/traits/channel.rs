// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Channel adapter trait for outbound message delivery.

use async_trait::async_trait;

use crate::error::NurtureError;
use crate::traits::adapter::PluginAdapter;
use crate::types::{MessageId, OutboundMessage};

/// Adapter for delivering rendered messages to users.
///
/// The engine does not assume the channel deduplicates: the same queue row
/// may be handed over more than once when a claim expires mid-send.
#[async_trait]
pub trait ChannelAdapter: PluginAdapter {
    /// Sends a message through the channel.
    async fn send(&self, msg: OutboundMessage) -> Result<MessageId, NurtureError>;
}
