// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types used across adapter traits and the Nurture engine.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Identifier returned by a channel for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

/// Health status reported by adapter health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Adapter is fully operational.
    Healthy,
    /// Adapter is operational but experiencing issues.
    Degraded(String),
    /// Adapter is not operational.
    Unhealthy(String),
}

/// Identifies the type of adapter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
pub enum AdapterType {
    Channel,
    Storage,
    Observability,
}

/// Domain event kinds that can start a sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    NewUser,
    FirstCommitment,
    StreakMilestone,
    MeetingAttended,
    FirstMeetingAttended,
    MeetingMissed,
    EarlyArrival,
    LateArrival,
    Reconnection,
    InactiveUser,
}

/// Lifecycle state of a sequence instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl InstanceStatus {
    /// Running and paused instances count against the one-active-instance rule.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Completed, cancelled and failed instances never change again on their own.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Delivery channel for a message. Also used as the metrics `message_type`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Chat,
    Email,
    Sms,
}

/// Attendance-derived event kinds emitted by the correlator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttendanceEventType {
    /// Emitted for every matched attendee of every meeting.
    MeetingAttended,
    FirstMeetingAttended,
    MeetingMissed,
    EarlyArrival,
    LateArrival,
    Reconnection,
}

impl AttendanceEventType {
    /// The trigger type the scheduler sees when this event is dispatched.
    pub fn trigger_type(self) -> TriggerType {
        match self {
            Self::MeetingAttended => TriggerType::MeetingAttended,
            Self::FirstMeetingAttended => TriggerType::FirstMeetingAttended,
            Self::MeetingMissed => TriggerType::MeetingMissed,
            Self::EarlyArrival => TriggerType::EarlyArrival,
            Self::LateArrival => TriggerType::LateArrival,
            Self::Reconnection => TriggerType::Reconnection,
        }
    }
}

/// Derived delivery state of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Claimed,
    Sent,
    Failed,
    Skipped,
}

/// An outbound message handed to a channel adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Queue row id; channels may use it as an idempotency key.
    pub queue_id: i64,
    /// Delivery attempt number, starting at 1.
    pub attempt: u32,
    pub channel: Channel,
    pub channel_user_id: String,
    /// Fully rendered content.
    pub content: String,
}
