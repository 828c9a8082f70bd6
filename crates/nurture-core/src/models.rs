// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain records shared between the engine and storage backends.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::TriggerCondition;
use crate::error::NurtureError;
use crate::types::{AttendanceEventType, Channel, InstanceStatus, MessageState, TriggerType};

/// Sequence type recorded on messages that do not belong to a sequence.
pub const AD_HOC_SEQUENCE_TYPE: &str = "ad_hoc";

/// A user known to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    /// Email domain the user has proven ownership of.
    pub verified_domain: Option<String>,
    /// Address on the delivery channel (chat id, phone number, ...).
    pub channel_user_id: String,
    pub timezone: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One timed message of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceStep {
    pub content_template: String,
    pub delay_from_previous: TimeDelta,
    pub channel: Channel,
}

/// An immutable sequence definition.
#[derive(Debug, Clone)]
pub struct SequenceDefinition {
    pub id: String,
    pub name: String,
    pub sequence_type: String,
    pub trigger_type: TriggerType,
    pub trigger_conditions: Vec<TriggerCondition>,
    pub steps: Vec<SequenceStep>,
    pub max_executions_per_user: Option<u32>,
    pub allow_concurrent: bool,
    pub priority: u8,
    pub active: bool,
}

impl SequenceDefinition {
    pub fn step(&self, index: u32) -> Option<&SequenceStep> {
        self.steps.get(index as usize)
    }

    pub fn total_steps(&self) -> u32 {
        self.steps.len() as u32
    }

    /// Evaluate every trigger condition against `payload`. All must hold.
    pub fn conditions_hold(&self, payload: &Value) -> Result<bool, NurtureError> {
        for condition in &self.trigger_conditions {
            let holds = condition
                .evaluate(payload)
                .map_err(|message| NurtureError::TriggerEvaluation {
                    sequence_id: self.id.clone(),
                    message,
                })?;
            if !holds {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A domain fact that may start a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub user_id: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

/// One user's execution of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceInstance {
    pub id: i64,
    pub user_id: String,
    pub sequence_id: String,
    pub sequence_type: String,
    /// Index of the step whose message is pending; equals `total_steps` once completed.
    pub current_step: u32,
    pub total_steps: u32,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub next_step_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub execution_context: Map<String, Value>,
    pub error_message: Option<String>,
}

/// Values needed to create a sequence instance.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSequenceInstance {
    pub user_id: String,
    pub sequence_id: String,
    pub sequence_type: String,
    pub total_steps: u32,
    /// Non-concurrent instances take part in the one-active-instance constraint.
    pub exclusive: bool,
    /// Lifetime limit on instances of this sequence for the user.
    pub max_executions: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub next_step_at: DateTime<Utc>,
    pub execution_context: Map<String, Value>,
}

/// A durable message row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub id: i64,
    pub user_id: String,
    pub sequence_instance_id: Option<i64>,
    pub step_index: Option<u32>,
    pub sequence_type: String,
    pub channel: Channel,
    pub channel_user_id: String,
    pub content: String,
    pub priority: u8,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub skipped_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_token: Option<String>,
    pub error_message: Option<String>,
}

impl QueuedMessage {
    pub fn state(&self) -> MessageState {
        if self.sent_at.is_some() {
            MessageState::Sent
        } else if self.failed_at.is_some() {
            MessageState::Failed
        } else if self.skipped_at.is_some() {
            MessageState::Skipped
        } else if self.claim_token.is_some() {
            MessageState::Claimed
        } else {
            MessageState::Pending
        }
    }
}

/// Values needed to enqueue a message.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueuedMessage {
    pub user_id: String,
    pub sequence_instance_id: Option<i64>,
    pub step_index: Option<u32>,
    pub sequence_type: String,
    pub channel: Channel,
    pub channel_user_id: String,
    pub content: String,
    pub priority: u8,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub max_retries: u32,
}

/// Instance progression committed together with a sent acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct StepAdvance {
    pub instance_id: i64,
    /// The step whose message was just sent.
    pub completed_step: u32,
    /// The next step's message, or `None` when the sent step was the last one.
    pub next: Option<NewQueuedMessage>,
}

/// Result of creating an instance together with its first message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { instance_id: i64, message_id: i64 },
    /// A non-concurrent instance is already running or paused.
    AlreadyActive,
    /// The user has used up the sequence's execution cap.
    ExecutionCapReached,
}

/// Result of acknowledging a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged { completed: bool },
    /// The claim expired and was taken by another worker; nothing was written.
    ClaimLost,
}

/// Result of recording a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled {
        retry_count: u32,
        retry_at: DateTime<Utc>,
    },
    /// Retries are exhausted; the message and its instance are failed.
    Exhausted { retry_count: u32 },
    /// The instance was cancelled while the message was claimed; the
    /// message is skipped rather than retried.
    Skipped,
    ClaimLost,
}

/// Per-user, per-sequence-type delivery preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreference {
    pub user_id: String,
    /// `None` applies to every sequence type.
    pub sequence_type: Option<String>,
    pub enabled: bool,
    pub frequency: String,
    pub time_preference: Option<String>,
    pub timezone: Option<String>,
    pub opted_out_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserPreference {
    /// A preference row with default settings for `user_id`.
    pub fn new(user_id: &str, sequence_type: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            sequence_type: sequence_type.map(str::to_string),
            enabled: true,
            frequency: "normal".to_string(),
            time_preference: None,
            timezone: None,
            opted_out_at: None,
            updated_at: now,
        }
    }

    pub fn blocks_delivery(&self) -> bool {
        !self.enabled || self.opted_out_at.is_some()
    }
}

/// A scheduled meeting and its invite list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub meeting_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    /// Internal user ids expected to attend.
    #[serde(default)]
    pub invitees: Vec<String>,
    #[serde(default)]
    pub last_correlated_at: Option<DateTime<Utc>>,
}

/// A participant record reported by the external meeting platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub join_time: DateTime<Utc>,
    #[serde(default)]
    pub leave_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_type: Option<String>,
}

/// A participant record together with how it was resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantAudit {
    pub meeting_id: String,
    /// Unique per meeting: identity plus join time.
    pub participant_key: String,
    /// Email or normalized name; the key used for confirmed mappings.
    pub identity_key: String,
    pub record: ParticipantRecord,
    pub match_score: f64,
    pub resolved_user_id: Option<String>,
    pub unmatched_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A user's merged attendance for one meeting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub meeting_id: String,
    pub user_id: String,
    pub join_time: DateTime<Utc>,
    pub leave_time: Option<DateTime<Utc>>,
    pub duration_secs: i64,
    /// Signed seconds between join and scheduled start; negative is early.
    pub lateness_secs: i64,
    pub match_confidence: f64,
    pub session_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// A persisted attendance-derived event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub id: i64,
    pub user_id: String,
    pub meeting_id: String,
    pub event_type: AttendanceEventType,
    pub event_time: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub nurture_triggered: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// An attendance event about to be emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttendanceEvent {
    pub user_id: String,
    pub meeting_id: String,
    pub event_type: AttendanceEventType,
    pub event_time: DateTime<Utc>,
    pub metadata: Value,
}

/// Everything one correlation run writes, applied in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationWrite {
    pub meeting_id: String,
    pub correlated_at: DateTime<Utc>,
    pub participants: Vec<ParticipantAudit>,
    pub attendance: Vec<AttendanceRecord>,
    pub events: Vec<NewAttendanceEvent>,
    /// Users matched in this run; their unprocessed `meeting_missed` events are withdrawn.
    pub matched_user_ids: Vec<String>,
}

/// Daily delivery counters for one sequence type and message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyMetrics {
    pub metric_date: NaiveDate,
    pub sequence_type: String,
    pub message_type: String,
    pub scheduled: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub unique_users: u64,
    pub updated_at: DateTime<Utc>,
}

/// Row counts removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub messages_deleted: usize,
    pub metrics_deleted: usize,
    pub leases_deleted: usize,
}
