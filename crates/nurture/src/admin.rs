// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot admin commands.
//!
//! Each command opens the database, performs one engine operation and prints
//! its result as JSON. No channel is built: admin commands never deliver.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use nurture_config::NurtureConfig;
use nurture_core::models::{Meeting, ParticipantRecord, TriggerEvent, User};
use nurture_core::{Channel, NurtureError, StorageAdapter, TriggerType};
use nurture_engine::{
    AttendanceCorrelator, MetricsAggregator, RetentionSweeper, SequenceRegistry,
    SequenceScheduler,
};
use nurture_storage::SqliteStorage;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::info;

/// Fields of `nurture user add`.
#[derive(Debug)]
pub struct NewUser {
    pub user_id: String,
    pub channel_user_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub verified_domain: Option<String>,
    pub timezone: Option<String>,
}

/// Engine components needed by admin commands, over one storage connection.
pub struct Admin {
    storage: Arc<dyn StorageAdapter + Send + Sync>,
    scheduler: SequenceScheduler,
    correlator: AttendanceCorrelator,
    aggregator: MetricsAggregator,
    sweeper: RetentionSweeper,
}

impl Admin {
    /// Open and migrate the configured database.
    pub async fn open(config: &NurtureConfig) -> Result<Self, NurtureError> {
        let storage = SqliteStorage::new(config.storage.clone());
        storage.initialize().await?;
        let storage: Arc<dyn StorageAdapter + Send + Sync> = Arc::new(storage);
        Self::with_storage(config, storage)
    }

    fn with_storage(
        config: &NurtureConfig,
        storage: Arc<dyn StorageAdapter + Send + Sync>,
    ) -> Result<Self, NurtureError> {
        let registry = Arc::new(SequenceRegistry::from_config(&config.sequences)?);
        Ok(Self {
            scheduler: SequenceScheduler::new(storage.clone(), registry, &config.retry),
            correlator: AttendanceCorrelator::new(storage.clone(), &config.correlation),
            aggregator: MetricsAggregator::new(storage.clone()),
            sweeper: RetentionSweeper::new(storage.clone(), &config.retention),
            storage,
        })
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter + Send + Sync> {
        &self.storage
    }

    pub async fn close(&self) -> Result<(), NurtureError> {
        self.storage.close().await
    }

    pub async fn trigger(
        &self,
        user_id: String,
        trigger_type: TriggerType,
        payload: Option<Value>,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        let event = TriggerEvent {
            user_id,
            trigger_type,
            payload: payload.unwrap_or_else(|| Value::Object(Map::new())),
            occurred_at,
        };
        let outcomes = self.scheduler.on_trigger_event(&event).await?;
        let rows: Vec<Value> = outcomes
            .into_iter()
            .map(|(sequence_id, outcome)| json!({ "sequence_id": sequence_id, "result": outcome }))
            .collect();
        print_json(&rows)
    }

    pub async fn enqueue(
        &self,
        user_id: &str,
        content: &str,
        channel: Channel,
        priority: u8,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        let message_id = self
            .scheduler
            .enqueue_ad_hoc(user_id, content, channel, priority, scheduled_for, now)
            .await?;
        print_json(&json!({ "message_id": message_id }))
    }

    /// Create the user, or update every field but `created_at`.
    pub async fn add_user(&self, new: NewUser, now: DateTime<Utc>) -> Result<(), NurtureError> {
        let created_at = self
            .storage
            .get_user(&new.user_id)
            .await?
            .map_or(now, |existing| existing.created_at);
        let user = User {
            user_id: new.user_id,
            display_name: new.display_name,
            email: new.email,
            verified_domain: new.verified_domain.map(|d| d.to_lowercase()),
            channel_user_id: new.channel_user_id,
            timezone: new.timezone,
            created_at,
        };
        self.storage.upsert_user(&user).await?;
        info!(user_id = user.user_id.as_str(), "user saved");
        print_json(&user)
    }

    pub async fn add_meeting(
        &self,
        meeting_id: String,
        title: Option<String>,
        scheduled_start: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
        invitees: Vec<String>,
    ) -> Result<(), NurtureError> {
        if scheduled_end <= scheduled_start {
            return Err(NurtureError::Config(format!(
                "meeting {meeting_id} must end after it starts"
            )));
        }
        let last_correlated_at = self
            .storage
            .get_meeting(&meeting_id)
            .await?
            .and_then(|m| m.last_correlated_at);
        let meeting = Meeting {
            meeting_id,
            title,
            scheduled_start,
            scheduled_end,
            invitees,
            last_correlated_at,
        };
        self.storage.upsert_meeting(&meeting).await?;
        info!(meeting_id = meeting.meeting_id.as_str(), "meeting saved");
        print_json(&meeting)
    }

    pub async fn correlate(
        &self,
        meeting_id: &str,
        records_path: &Path,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        let records = read_records(records_path)?;
        let report = self
            .correlator
            .correlate_meeting(meeting_id, records, now)
            .await?;
        print_json(&report)
    }

    pub async fn recorrelate(&self, meeting_id: &str, now: DateTime<Utc>) -> Result<(), NurtureError> {
        let report = self.correlator.recorrelate(meeting_id, now).await?;
        print_json(&report)
    }

    pub async fn resolve(
        &self,
        meeting_id: &str,
        participant_key: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        let report = self
            .correlator
            .resolve_participant(meeting_id, participant_key, user_id, now)
            .await?;
        print_json(&report)
    }

    pub async fn opt_out(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        let cancelled = self.scheduler.opt_out(user_id, sequence_type, now).await?;
        print_json(&json!({
            "user_id": user_id,
            "sequence_type": sequence_type,
            "cancelled_instances": cancelled,
        }))
    }

    pub async fn opt_in(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        self.scheduler.opt_in(user_id, sequence_type, now).await?;
        let preferences = self.scheduler.preferences().preferences(user_id).await?;
        print_json(&preferences)
    }

    pub async fn pause(&self, instance_id: i64, now: DateTime<Utc>) -> Result<(), NurtureError> {
        self.scheduler.pause(instance_id, now).await?;
        self.print_instance(instance_id).await
    }

    pub async fn resume(&self, instance_id: i64, now: DateTime<Utc>) -> Result<(), NurtureError> {
        self.scheduler.resume(instance_id, now).await?;
        self.print_instance(instance_id).await
    }

    pub async fn cancel(&self, instance_id: i64, now: DateTime<Utc>) -> Result<(), NurtureError> {
        self.scheduler.cancel(instance_id, now).await?;
        self.print_instance(instance_id).await
    }

    pub async fn requeue(&self, message_id: i64, now: DateTime<Utc>) -> Result<(), NurtureError> {
        self.scheduler.requeue(message_id, now).await?;
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| NurtureError::not_found("message", message_id.to_string()))?;
        print_json(&message)
    }

    pub async fn metrics(
        &self,
        date: Option<NaiveDate>,
        refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        if refresh {
            self.aggregator.refresh(now).await?;
        }
        let rows = self
            .aggregator
            .daily(date.unwrap_or_else(|| now.date_naive()))
            .await?;
        print_json(&rows)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<(), NurtureError> {
        let report = self.sweeper.sweep(now).await?;
        print_json(&report)
    }

    async fn print_instance(&self, instance_id: i64) -> Result<(), NurtureError> {
        let instance = self
            .storage
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| NurtureError::not_found("sequence instance", instance_id.to_string()))?;
        print_json(&instance)
    }
}

pub fn print_config(config: &NurtureConfig) -> Result<(), NurtureError> {
    print!("{}", render_config(config)?);
    Ok(())
}

/// The effective configuration as TOML, with the channel token masked.
fn render_config(config: &NurtureConfig) -> Result<String, NurtureError> {
    let mut shown = config.clone();
    if shown.channel.auth_token.is_some() {
        shown.channel.auth_token = Some("********".to_string());
    }
    toml::to_string_pretty(&shown)
        .map_err(|e| NurtureError::Internal(format!("failed to render configuration: {e}")))
}

/// Read a JSON array of participant records from a file, or stdin for `-`.
fn read_records(path: &Path) -> Result<Vec<ParticipantRecord>, NurtureError> {
    let mut raw = String::new();
    if path == Path::new("-") {
        std::io::stdin()
            .read_to_string(&mut raw)
            .map_err(|e| NurtureError::Internal(format!("failed to read stdin: {e}")))?;
    } else {
        raw = std::fs::read_to_string(path).map_err(|e| {
            NurtureError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
    }
    parse_records(&raw)
}

fn parse_records(raw: &str) -> Result<Vec<ParticipantRecord>, NurtureError> {
    serde_json::from_str(raw)
        .map_err(|e| NurtureError::Config(format!("invalid participant records: {e}")))
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), NurtureError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| NurtureError::Internal(format!("failed to render output: {e}")))?;
    println!("{rendered}");
    Ok(())
}
