// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite implementation of the StorageAdapter trait.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::OnceCell;
use tracing::debug;

use nurture_config::model::StorageConfig;
use nurture_core::models::{
    AckOutcome, AttendanceEvent, AttendanceRecord, CorrelationWrite, DailyMetrics,
    FailureOutcome, Meeting, NewQueuedMessage, NewSequenceInstance, ParticipantAudit,
    QueuedMessage, SequenceInstance, StartOutcome, StepAdvance, SweepReport, User,
    UserPreference,
};
use nurture_core::{
    AdapterType, HealthStatus, InstanceStatus, NurtureError, PluginAdapter, StorageAdapter,
};

use crate::database::Database;
use crate::queries;

/// SQLite-backed storage adapter.
///
/// Wraps a [`Database`] handle and delegates all query operations to the
/// typed query modules. The database is opened on the first call to
/// [`StorageAdapter::initialize`].
pub struct SqliteStorage {
    config: StorageConfig,
    db: OnceCell<Database>,
}

impl SqliteStorage {
    /// The database connection is not opened until `initialize` is called.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            db: OnceCell::new(),
        }
    }

    fn db(&self) -> Result<&Database, NurtureError> {
        self.db.get().ok_or_else(|| NurtureError::Storage {
            source: "storage not initialized -- call initialize() first".into(),
        })
    }

    async fn checkpoint(&self, db: &Database) -> Result<(), NurtureError> {
        if !self.config.wal_mode {
            return Ok(());
        }
        db.connection()
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(crate::database::map_tr_err)?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

#[async_trait]
impl PluginAdapter for SqliteStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(0, 1, 0)
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Storage
    }

    async fn health_check(&self) -> Result<HealthStatus, NurtureError> {
        let db = self.db()?;
        db.connection()
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch("SELECT 1;")?;
                Ok(())
            })
            .await
            .map_err(crate::database::map_tr_err)?;
        Ok(HealthStatus::Healthy)
    }

    async fn shutdown(&self) -> Result<(), NurtureError> {
        if let Some(db) = self.db.get() {
            self.checkpoint(db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn initialize(&self) -> Result<(), NurtureError> {
        if self.db.initialized() {
            return Err(NurtureError::Storage {
                source: "storage already initialized".into(),
            });
        }
        let db = Database::open_with(&self.config.database_path, self.config.wal_mode).await?;
        self.db.set(db).map_err(|_| NurtureError::Storage {
            source: "storage already initialized".into(),
        })?;
        debug!(path = %self.config.database_path, "SQLite storage initialized");
        Ok(())
    }

    async fn close(&self) -> Result<(), NurtureError> {
        let db = self.db()?;
        self.checkpoint(db).await
    }

    // --- Users ---

    async fn upsert_user(&self, user: &User) -> Result<(), NurtureError> {
        queries::users::upsert_user(self.db()?, user).await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, NurtureError> {
        queries::users::get_user(self.db()?, user_id).await
    }

    async fn list_users(&self) -> Result<Vec<User>, NurtureError> {
        queries::users::list_users(self.db()?).await
    }

    // --- Sequence instances ---

    async fn start_instance(
        &self,
        instance: &NewSequenceInstance,
        first_message: &NewQueuedMessage,
    ) -> Result<StartOutcome, NurtureError> {
        queries::instances::start_instance(self.db()?, instance, first_message).await
    }

    async fn get_instance(&self, id: i64) -> Result<Option<SequenceInstance>, NurtureError> {
        queries::instances::get_instance(self.db()?, id).await
    }

    async fn find_active_instance(
        &self,
        user_id: &str,
        sequence_id: &str,
    ) -> Result<Option<SequenceInstance>, NurtureError> {
        queries::instances::find_active_instance(self.db()?, user_id, sequence_id).await
    }

    async fn list_instances_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SequenceInstance>, NurtureError> {
        queries::instances::list_instances_for_user(self.db()?, user_id).await
    }

    async fn transition_instance(
        &self,
        id: i64,
        from: &[InstanceStatus],
        to: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError> {
        queries::instances::transition_instance(self.db()?, id, from, to, now).await
    }

    async fn cancel_instance(
        &self,
        id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError> {
        queries::instances::cancel_instance(self.db()?, id, reason, now).await
    }

    async fn cancel_active_instances(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, NurtureError> {
        queries::instances::cancel_active_instances(self.db()?, user_id, sequence_type, reason, now)
            .await
    }

    async fn list_stalled_instances(&self) -> Result<Vec<SequenceInstance>, NurtureError> {
        queries::instances::list_stalled_instances(self.db()?).await
    }

    // --- Message queue ---

    async fn enqueue_message(
        &self,
        message: &NewQueuedMessage,
    ) -> Result<Option<i64>, NurtureError> {
        queries::queue::enqueue_message(self.db()?, message).await
    }

    async fn get_message(&self, id: i64) -> Result<Option<QueuedMessage>, NurtureError> {
        queries::queue::get_message(self.db()?, id).await
    }

    async fn list_messages_for_instance(
        &self,
        instance_id: i64,
    ) -> Result<Vec<QueuedMessage>, NurtureError> {
        queries::queue::list_messages_for_instance(self.db()?, instance_id).await
    }

    async fn list_messages_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<QueuedMessage>, NurtureError> {
        queries::queue::list_messages_for_user(self.db()?, user_id).await
    }

    async fn due_message_ids(
        &self,
        now: DateTime<Utc>,
        claim_expired_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<i64>, NurtureError> {
        queries::queue::due_message_ids(self.db()?, now, claim_expired_before, limit).await
    }

    async fn claim_message(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
        claim_expired_before: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, NurtureError> {
        queries::queue::claim_message(self.db()?, id, token, now, claim_expired_before).await
    }

    async fn release_claim(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError> {
        queries::queue::release_claim(self.db()?, id, token, now).await
    }

    async fn acknowledge_sent(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
        advance: Option<&StepAdvance>,
    ) -> Result<AckOutcome, NurtureError> {
        queries::queue::acknowledge_sent(self.db()?, id, token, now, advance).await
    }

    async fn record_failure(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailureOutcome, NurtureError> {
        queries::queue::record_failure(self.db()?, id, token, now, error, retry_at).await
    }

    async fn mark_skipped(
        &self,
        id: i64,
        token: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError> {
        queries::queue::mark_skipped(self.db()?, id, token, reason, now).await
    }

    async fn requeue_message(&self, id: i64, now: DateTime<Utc>) -> Result<bool, NurtureError> {
        queries::queue::requeue_message(self.db()?, id, now).await
    }

    // --- Preferences ---

    async fn get_preferences(&self, user_id: &str) -> Result<Vec<UserPreference>, NurtureError> {
        queries::preferences::get_preferences(self.db()?, user_id).await
    }

    async fn upsert_preference(&self, preference: &UserPreference) -> Result<(), NurtureError> {
        queries::preferences::upsert_preference(self.db()?, preference).await
    }

    // --- Meetings and attendance ---

    async fn upsert_meeting(&self, meeting: &Meeting) -> Result<(), NurtureError> {
        queries::attendance::upsert_meeting(self.db()?, meeting).await
    }

    async fn get_meeting(&self, meeting_id: &str) -> Result<Option<Meeting>, NurtureError> {
        queries::attendance::get_meeting(self.db()?, meeting_id).await
    }

    async fn participant_mappings(&self) -> Result<HashMap<String, String>, NurtureError> {
        queries::attendance::participant_mappings(self.db()?).await
    }

    async fn confirm_participant_mapping(
        &self,
        identity_key: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        queries::attendance::confirm_participant_mapping(self.db()?, identity_key, user_id, now)
            .await
    }

    async fn acquire_meeting_lease(
        &self,
        meeting_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, NurtureError> {
        queries::attendance::acquire_meeting_lease(self.db()?, meeting_id, holder, now, expires_at)
            .await
    }

    async fn release_meeting_lease(
        &self,
        meeting_id: &str,
        holder: &str,
    ) -> Result<(), NurtureError> {
        queries::attendance::release_meeting_lease(self.db()?, meeting_id, holder).await
    }

    async fn users_with_other_attendance(
        &self,
        meeting_id: &str,
        user_ids: &[String],
    ) -> Result<HashSet<String>, NurtureError> {
        queries::attendance::users_with_other_attendance(self.db()?, meeting_id, user_ids).await
    }

    async fn apply_correlation(&self, write: &CorrelationWrite) -> Result<usize, NurtureError> {
        queries::attendance::apply_correlation(self.db()?, write).await
    }

    async fn list_attendance(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<AttendanceRecord>, NurtureError> {
        queries::attendance::list_attendance(self.db()?, meeting_id).await
    }

    async fn list_participants(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<ParticipantAudit>, NurtureError> {
        queries::attendance::list_participants(self.db()?, meeting_id).await
    }

    async fn list_attendance_events(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<AttendanceEvent>, NurtureError> {
        queries::attendance::list_attendance_events(self.db()?, meeting_id).await
    }

    async fn pending_attendance_events(
        &self,
        limit: usize,
    ) -> Result<Vec<AttendanceEvent>, NurtureError> {
        queries::attendance::pending_attendance_events(self.db()?, limit).await
    }

    async fn claim_attendance_event(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, NurtureError> {
        queries::attendance::claim_attendance_event(self.db()?, id, now).await
    }

    async fn complete_attendance_event(
        &self,
        id: i64,
        nurture_triggered: bool,
    ) -> Result<(), NurtureError> {
        queries::attendance::complete_attendance_event(self.db()?, id, nurture_triggered).await
    }

    async fn release_attendance_event(&self, id: i64) -> Result<(), NurtureError> {
        queries::attendance::release_attendance_event(self.db()?, id).await
    }

    // --- Metrics and retention ---

    async fn refresh_daily_metrics(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyMetrics>, NurtureError> {
        queries::metrics::refresh_daily_metrics(self.db()?, date, now).await
    }

    async fn get_daily_metrics(&self, date: NaiveDate) -> Result<Vec<DailyMetrics>, NurtureError> {
        queries::metrics::get_daily_metrics(self.db()?, date).await
    }

    async fn sweep_retention(
        &self,
        message_cutoff: DateTime<Utc>,
        metrics_cutoff: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, NurtureError> {
        queries::metrics::sweep_retention(self.db()?, message_cutoff, metrics_cutoff, now).await
    }
}
