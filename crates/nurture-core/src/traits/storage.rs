// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage adapter trait for persistence backends (SQLite, etc.).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::NurtureError;
use crate::models::{
    AckOutcome, AttendanceEvent, AttendanceRecord, CorrelationWrite, DailyMetrics,
    FailureOutcome, Meeting, NewQueuedMessage, NewSequenceInstance, ParticipantAudit,
    QueuedMessage, SequenceInstance, StartOutcome, StepAdvance, SweepReport, User,
    UserPreference,
};
use crate::traits::adapter::PluginAdapter;
use crate::types::InstanceStatus;

/// Adapter for storage and persistence backends.
///
/// Every method that changes more than one row is a single transaction.
/// Queue mutations are conditional on the caller's claim token so that a
/// worker whose claim expired can never overwrite another worker's result.
#[async_trait]
pub trait StorageAdapter: PluginAdapter {
    /// Initializes the storage backend (migrations, connection, etc.).
    async fn initialize(&self) -> Result<(), NurtureError>;

    /// Closes the storage backend, flushing pending writes.
    async fn close(&self) -> Result<(), NurtureError>;

    // --- Users ---

    async fn upsert_user(&self, user: &User) -> Result<(), NurtureError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, NurtureError>;

    async fn list_users(&self) -> Result<Vec<User>, NurtureError>;

    // --- Sequence instances ---

    /// Create an instance and enqueue its first message atomically.
    ///
    /// Returns [`StartOutcome::AlreadyActive`] when the one-active-instance
    /// constraint rejects the insert and [`StartOutcome::ExecutionCapReached`]
    /// when the user already has `max_executions` instances of the sequence.
    /// The cap is counted inside the same write transaction as the insert.
    async fn start_instance(
        &self,
        instance: &NewSequenceInstance,
        first_message: &NewQueuedMessage,
    ) -> Result<StartOutcome, NurtureError>;

    async fn get_instance(&self, id: i64) -> Result<Option<SequenceInstance>, NurtureError>;

    /// The running or paused instance of a sequence for a user, if any.
    async fn find_active_instance(
        &self,
        user_id: &str,
        sequence_id: &str,
    ) -> Result<Option<SequenceInstance>, NurtureError>;

    async fn list_instances_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SequenceInstance>, NurtureError>;

    /// Move an instance to `to` if its current status is one of `from`.
    async fn transition_instance(
        &self,
        id: i64,
        from: &[InstanceStatus],
        to: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError>;

    /// Cancel one active instance and mark its unsent messages skipped.
    async fn cancel_instance(
        &self,
        id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError>;

    /// Cancel every active instance of a user, optionally limited to one
    /// sequence type, and mark their unsent messages skipped.
    async fn cancel_active_instances(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, NurtureError>;

    /// Running instances with no message row for their current step.
    async fn list_stalled_instances(&self) -> Result<Vec<SequenceInstance>, NurtureError>;

    // --- Message queue ---

    /// Insert a message. Returns `None` when a message for the same
    /// instance step already exists.
    async fn enqueue_message(&self, message: &NewQueuedMessage)
    -> Result<Option<i64>, NurtureError>;

    async fn get_message(&self, id: i64) -> Result<Option<QueuedMessage>, NurtureError>;

    async fn list_messages_for_instance(
        &self,
        instance_id: i64,
    ) -> Result<Vec<QueuedMessage>, NurtureError>;

    async fn list_messages_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<QueuedMessage>, NurtureError>;

    /// Ids of due, deliverable messages ordered by priority then due time.
    ///
    /// A message is deliverable when it is unsent, not failed, not skipped,
    /// unclaimed (or claimed before `claim_expired_before`) and either ad hoc
    /// or owned by a running instance.
    async fn due_message_ids(
        &self,
        now: DateTime<Utc>,
        claim_expired_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<i64>, NurtureError>;

    /// Claim one message with a single conditional update.
    ///
    /// Returns the claimed row, or `None` when another worker won the race
    /// or the message is no longer deliverable.
    async fn claim_message(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
        claim_expired_before: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, NurtureError>;

    /// Give a claim back without recording an attempt.
    ///
    /// A message whose instance was cancelled while it was claimed is
    /// settled as skipped instead of returning to the queue.
    async fn release_claim(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError>;

    /// Mark a message sent and apply the instance advance in one transaction.
    async fn acknowledge_sent(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
        advance: Option<&StepAdvance>,
    ) -> Result<AckOutcome, NurtureError>;

    /// Record a failed attempt.
    ///
    /// Below `max_retries` the message is rescheduled at `retry_at`; at the
    /// limit it is failed together with its owning instance.
    async fn record_failure(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailureOutcome, NurtureError>;

    async fn mark_skipped(
        &self,
        id: i64,
        token: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError>;

    /// Put a failed message back in the queue with a fresh retry budget and
    /// reopen its instance if the failure had closed it.
    async fn requeue_message(&self, id: i64, now: DateTime<Utc>) -> Result<bool, NurtureError>;

    // --- Preferences ---

    async fn get_preferences(&self, user_id: &str) -> Result<Vec<UserPreference>, NurtureError>;

    async fn upsert_preference(&self, preference: &UserPreference) -> Result<(), NurtureError>;

    // --- Meetings and attendance ---

    async fn upsert_meeting(&self, meeting: &Meeting) -> Result<(), NurtureError>;

    async fn get_meeting(&self, meeting_id: &str) -> Result<Option<Meeting>, NurtureError>;

    /// Confirmed identity key to user id mappings.
    async fn participant_mappings(&self) -> Result<HashMap<String, String>, NurtureError>;

    async fn confirm_participant_mapping(
        &self,
        identity_key: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError>;

    /// Take the per-meeting correlation lease if it is free or expired.
    async fn acquire_meeting_lease(
        &self,
        meeting_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, NurtureError>;

    async fn release_meeting_lease(&self, meeting_id: &str, holder: &str)
    -> Result<(), NurtureError>;

    /// Users among `user_ids` with attendance recorded for another meeting.
    async fn users_with_other_attendance(
        &self,
        meeting_id: &str,
        user_ids: &[String],
    ) -> Result<HashSet<String>, NurtureError>;

    /// Apply a correlation run. Returns the number of newly inserted events.
    async fn apply_correlation(&self, write: &CorrelationWrite) -> Result<usize, NurtureError>;

    async fn list_attendance(&self, meeting_id: &str)
    -> Result<Vec<AttendanceRecord>, NurtureError>;

    async fn list_participants(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<ParticipantAudit>, NurtureError>;

    async fn list_attendance_events(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<AttendanceEvent>, NurtureError>;

    async fn pending_attendance_events(
        &self,
        limit: usize,
    ) -> Result<Vec<AttendanceEvent>, NurtureError>;

    /// Stamp `processed_at` if the event is still unprocessed.
    async fn claim_attendance_event(&self, id: i64, now: DateTime<Utc>)
    -> Result<bool, NurtureError>;

    async fn complete_attendance_event(
        &self,
        id: i64,
        nurture_triggered: bool,
    ) -> Result<(), NurtureError>;

    /// Clear `processed_at` so the event is dispatched again.
    async fn release_attendance_event(&self, id: i64) -> Result<(), NurtureError>;

    // --- Metrics and retention ---

    /// Recompute and upsert the daily rows for `date` from the queue.
    async fn refresh_daily_metrics(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyMetrics>, NurtureError>;

    async fn get_daily_metrics(&self, date: NaiveDate) -> Result<Vec<DailyMetrics>, NurtureError>;

    /// Delete terminal messages older than `message_cutoff`, metrics rows
    /// older than `metrics_cutoff` and expired meeting leases.
    async fn sweep_retention(
        &self,
        message_cutoff: DateTime<Utc>,
        metrics_cutoff: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, NurtureError>;
}
