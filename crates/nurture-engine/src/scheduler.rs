// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-user sequence state machine.
//!
//! The scheduler turns trigger events into sequence instances, advances an
//! instance when the worker acknowledges a sent step, and applies the admin
//! transitions (pause, resume, cancel, opt-out). Every write that touches an
//! instance and its messages together is a single storage transaction.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nurture_config::model::RetryConfig;
use nurture_core::models::{
    AD_HOC_SEQUENCE_TYPE, AckOutcome, NewQueuedMessage, NewSequenceInstance, QueuedMessage,
    SequenceDefinition, SequenceInstance, StartOutcome, StepAdvance, TriggerEvent, User,
};
use nurture_core::{Channel, InstanceStatus, MessageState, NurtureError, StorageAdapter};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::preferences::{PreferenceDecision, PreferenceGate};
use crate::registry::SequenceRegistry;

/// Why a matching sequence was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OptedOut,
    /// The preference store could not be read; delivery fails closed.
    PreferenceUnavailable,
    ExecutionCapReached,
    UnknownUser,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OptedOut => "opted_out",
            Self::PreferenceUnavailable => "preference_unavailable",
            Self::ExecutionCapReached => "execution_cap_reached",
            Self::UnknownUser => "unknown_user",
        })
    }
}

/// Result of offering a trigger event to one matching sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SchedulerOutcome {
    Started { instance_id: i64, message_id: i64 },
    /// A non-concurrent instance is already active; re-triggering is a no-op.
    AlreadyActive,
    Skipped { reason: SkipReason },
}

impl SchedulerOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// Reason recorded on messages and instances cancelled by an admin or an opt-out.
pub const CANCELLED_REASON: &str = "cancelled";

/// Reason recorded on instances whose definition was removed from config.
const DEFINITION_REMOVED_REASON: &str = "definition_removed";

pub struct SequenceScheduler {
    storage: Arc<dyn StorageAdapter + Send + Sync>,
    registry: Arc<SequenceRegistry>,
    preferences: PreferenceGate,
    max_retries: u32,
}

impl SequenceScheduler {
    pub fn new(
        storage: Arc<dyn StorageAdapter + Send + Sync>,
        registry: Arc<SequenceRegistry>,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            preferences: PreferenceGate::new(storage.clone()),
            storage,
            registry,
            max_retries: retry.max_retries,
        }
    }

    pub fn preferences(&self) -> &PreferenceGate {
        &self.preferences
    }

    /// Offer `event` to every matching sequence.
    ///
    /// An empty result means nothing matched. Storage failures abort the
    /// call so the caller can retry the whole event.
    pub async fn on_trigger_event(
        &self,
        event: &TriggerEvent,
    ) -> Result<Vec<(String, SchedulerOutcome)>, NurtureError> {
        let definitions = self.registry.matching(event);
        if definitions.is_empty() {
            debug!(
                user_id = event.user_id.as_str(),
                trigger_type = %event.trigger_type,
                "no sequence matches trigger"
            );
            return Ok(Vec::new());
        }

        let user = self.storage.get_user(&event.user_id).await?;
        let mut outcomes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let outcome = match &user {
                Some(user) => self.start(definition, user, event).await?,
                None => SchedulerOutcome::Skipped {
                    reason: SkipReason::UnknownUser,
                },
            };
            info!(
                user_id = event.user_id.as_str(),
                sequence_id = definition.id.as_str(),
                outcome = ?outcome,
                "trigger evaluated"
            );
            outcomes.push((definition.id.clone(), outcome));
        }
        Ok(outcomes)
    }

    async fn start(
        &self,
        definition: &SequenceDefinition,
        user: &User,
        event: &TriggerEvent,
    ) -> Result<SchedulerOutcome, NurtureError> {
        match self
            .preferences
            .check(&user.user_id, &definition.sequence_type)
            .await
        {
            Ok(PreferenceDecision::Allowed) => {}
            Ok(PreferenceDecision::OptedOut) => {
                return Ok(SchedulerOutcome::Skipped {
                    reason: SkipReason::OptedOut,
                });
            }
            Err(e) => {
                warn!(
                    user_id = user.user_id.as_str(),
                    error = %e,
                    "preference store unavailable, not starting sequence"
                );
                return Ok(SchedulerOutcome::Skipped {
                    reason: SkipReason::PreferenceUnavailable,
                });
            }
        }

        if !definition.allow_concurrent
            && self
                .storage
                .find_active_instance(&user.user_id, &definition.id)
                .await?
                .is_some()
        {
            return Ok(SchedulerOutcome::AlreadyActive);
        }

        let Some(first) = definition.step(0) else {
            return Err(NurtureError::Internal(format!(
                "sequence {} has no steps",
                definition.id
            )));
        };
        let next_step_at = event.occurred_at + first.delay_from_previous;
        let instance = NewSequenceInstance {
            user_id: user.user_id.clone(),
            sequence_id: definition.id.clone(),
            sequence_type: definition.sequence_type.clone(),
            total_steps: definition.total_steps(),
            exclusive: !definition.allow_concurrent,
            max_executions: definition.max_executions_per_user,
            started_at: event.occurred_at,
            next_step_at,
            execution_context: execution_context(&event.payload),
        };
        let message = self.step_message(
            definition,
            &user.user_id,
            &user.channel_user_id,
            None,
            0,
            next_step_at,
            event.occurred_at,
        )?;

        Ok(match self.storage.start_instance(&instance, &message).await? {
            StartOutcome::Started {
                instance_id,
                message_id,
            } => SchedulerOutcome::Started {
                instance_id,
                message_id,
            },
            StartOutcome::AlreadyActive => SchedulerOutcome::AlreadyActive,
            StartOutcome::ExecutionCapReached => SchedulerOutcome::Skipped {
                reason: SkipReason::ExecutionCapReached,
            },
        })
    }

    /// Build the queue row for `step` of `definition`.
    #[allow(clippy::too_many_arguments)]
    fn step_message(
        &self,
        definition: &SequenceDefinition,
        user_id: &str,
        channel_user_id: &str,
        instance_id: Option<i64>,
        step: u32,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<NewQueuedMessage, NurtureError> {
        let step_def = definition.step(step).ok_or_else(|| {
            NurtureError::Internal(format!("sequence {} has no step {step}", definition.id))
        })?;
        Ok(NewQueuedMessage {
            user_id: user_id.to_string(),
            sequence_instance_id: instance_id,
            step_index: Some(step),
            sequence_type: definition.sequence_type.clone(),
            channel: step_def.channel,
            channel_user_id: channel_user_id.to_string(),
            content: step_def.content_template.clone(),
            priority: definition.priority,
            scheduled_for,
            created_at: now,
            max_retries: self.max_retries,
        })
    }

    /// Mark a claimed message sent and advance its instance.
    ///
    /// The ack and the advance commit together. When the claim was lost to
    /// another worker nothing is written and [`AckOutcome::ClaimLost`] is
    /// returned.
    pub async fn acknowledge_sent(
        &self,
        message: &QueuedMessage,
        token: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<AckOutcome, NurtureError> {
        let (Some(instance_id), Some(step)) = (message.sequence_instance_id, message.step_index)
        else {
            return self
                .storage
                .acknowledge_sent(message.id, token, sent_at, None)
                .await;
        };

        let instance = self
            .storage
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| NurtureError::not_found("sequence instance", instance_id.to_string()))?;

        let Some(definition) = self.registry.get(&instance.sequence_id) else {
            let outcome = self
                .storage
                .acknowledge_sent(message.id, token, sent_at, None)
                .await?;
            if matches!(outcome, AckOutcome::Acknowledged { .. }) {
                warn!(
                    instance_id,
                    sequence_id = instance.sequence_id.as_str(),
                    "sequence definition no longer configured, cancelling instance"
                );
                self.storage
                    .cancel_instance(instance_id, DEFINITION_REMOVED_REASON, sent_at)
                    .await?;
            }
            return Ok(outcome);
        };

        let next_step = step + 1;
        let next = match definition.step(next_step) {
            Some(next_def) if next_step < instance.total_steps => Some(self.step_message(
                definition,
                &message.user_id,
                &message.channel_user_id,
                Some(instance_id),
                next_step,
                sent_at + next_def.delay_from_previous,
                sent_at,
            )?),
            _ => None,
        };
        let advance = StepAdvance {
            instance_id,
            completed_step: step,
            next,
        };

        let outcome = self
            .storage
            .acknowledge_sent(message.id, token, sent_at, Some(&advance))
            .await?;
        match outcome {
            AckOutcome::Acknowledged { completed: true } => {
                info!(instance_id, user_id = message.user_id.as_str(), "sequence completed");
            }
            AckOutcome::Acknowledged { completed: false } => {
                debug!(instance_id, step, "sequence advanced");
            }
            AckOutcome::ClaimLost => {
                warn!(message_id = message.id, "claim lost before ack, not advancing");
            }
        }
        Ok(outcome)
    }

    /// Enqueue a message that belongs to no sequence.
    pub async fn enqueue_ad_hoc(
        &self,
        user_id: &str,
        content: &str,
        channel: Channel,
        priority: u8,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64, NurtureError> {
        if !(1..=10).contains(&priority) {
            return Err(NurtureError::Config(format!(
                "priority {priority} is outside 1..=10"
            )));
        }
        let user = self
            .storage
            .get_user(user_id)
            .await?
            .ok_or_else(|| NurtureError::not_found("user", user_id))?;
        let message = NewQueuedMessage {
            user_id: user.user_id,
            sequence_instance_id: None,
            step_index: None,
            sequence_type: AD_HOC_SEQUENCE_TYPE.to_string(),
            channel,
            channel_user_id: user.channel_user_id,
            content: content.to_string(),
            priority,
            scheduled_for,
            created_at: now,
            max_retries: self.max_retries,
        };
        let id = self
            .storage
            .enqueue_message(&message)
            .await?
            .ok_or_else(|| NurtureError::Internal("ad hoc message was not inserted".into()))?;
        info!(message_id = id, user_id, "ad hoc message enqueued");
        Ok(id)
    }

    pub async fn pause(&self, instance_id: i64, now: DateTime<Utc>) -> Result<(), NurtureError> {
        self.transition(instance_id, InstanceStatus::Running, InstanceStatus::Paused, now)
            .await
    }

    /// Resume a paused instance, or reopen a failed one by requeueing its failed step.
    pub async fn resume(&self, instance_id: i64, now: DateTime<Utc>) -> Result<(), NurtureError> {
        let instance = self.instance(instance_id).await?;
        match instance.status {
            InstanceStatus::Paused => {
                self.transition(instance_id, InstanceStatus::Paused, InstanceStatus::Running, now)
                    .await
            }
            InstanceStatus::Failed => {
                let failed = self
                    .storage
                    .list_messages_for_instance(instance_id)
                    .await?
                    .into_iter()
                    .find(|m| {
                        m.step_index == Some(instance.current_step)
                            && m.state() == MessageState::Failed
                    })
                    .ok_or_else(|| invalid_transition(&instance, InstanceStatus::Running))?;
                self.requeue(failed.id, now).await
            }
            _ => Err(invalid_transition(&instance, InstanceStatus::Running)),
        }
    }

    pub async fn cancel(&self, instance_id: i64, now: DateTime<Utc>) -> Result<(), NurtureError> {
        if self
            .storage
            .cancel_instance(instance_id, CANCELLED_REASON, now)
            .await?
        {
            info!(instance_id, "sequence instance cancelled");
            return Ok(());
        }
        let instance = self.instance(instance_id).await?;
        Err(invalid_transition(&instance, InstanceStatus::Cancelled))
    }

    /// Put a failed message back in the queue with a fresh retry budget.
    pub async fn requeue(&self, message_id: i64, now: DateTime<Utc>) -> Result<(), NurtureError> {
        if self.storage.requeue_message(message_id, now).await? {
            info!(message_id, "failed message requeued");
            return Ok(());
        }
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| NurtureError::not_found("message", message_id.to_string()))?;
        Err(NurtureError::InvalidTransition {
            entity: "message",
            id: message_id.to_string(),
            from: message.state().to_string(),
            to: MessageState::Pending.to_string(),
        })
    }

    /// Record the opt-out, then cancel every active instance it covers.
    ///
    /// Returns the ids of the cancelled instances.
    pub async fn opt_out(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, NurtureError> {
        self.preferences.opt_out(user_id, sequence_type, now).await?;
        let cancelled = self
            .storage
            .cancel_active_instances(user_id, sequence_type, CANCELLED_REASON, now)
            .await?;
        if !cancelled.is_empty() {
            info!(user_id, count = cancelled.len(), "opt-out cancelled active instances");
        }
        Ok(cancelled)
    }

    pub async fn opt_in(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        self.preferences.opt_in(user_id, sequence_type, now).await?;
        Ok(())
    }

    /// Re-enqueue the pending message of running instances that lost it.
    ///
    /// Returns the number of messages enqueued.
    pub async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<usize, NurtureError> {
        let stalled = self.storage.list_stalled_instances().await?;
        let mut recovered = 0;
        for instance in stalled {
            let Some(definition) = self.registry.get(&instance.sequence_id) else {
                warn!(
                    instance_id = instance.id,
                    sequence_id = instance.sequence_id.as_str(),
                    "stalled instance has no configured definition"
                );
                continue;
            };
            let Some(user) = self.storage.get_user(&instance.user_id).await? else {
                warn!(
                    instance_id = instance.id,
                    user_id = instance.user_id.as_str(),
                    "stalled instance belongs to an unknown user"
                );
                continue;
            };
            let message = self.step_message(
                definition,
                &user.user_id,
                &user.channel_user_id,
                Some(instance.id),
                instance.current_step,
                instance.next_step_at.unwrap_or(now),
                now,
            )?;
            if self.storage.enqueue_message(&message).await?.is_some() {
                recovered += 1;
                info!(
                    instance_id = instance.id,
                    step = instance.current_step,
                    "re-enqueued step of stalled instance"
                );
            }
        }
        Ok(recovered)
    }

    async fn transition(
        &self,
        instance_id: i64,
        from: InstanceStatus,
        to: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<(), NurtureError> {
        if self
            .storage
            .transition_instance(instance_id, &[from], to, now)
            .await?
        {
            info!(instance_id, from = %from, to = %to, "sequence instance transitioned");
            return Ok(());
        }
        let instance = self.instance(instance_id).await?;
        Err(invalid_transition(&instance, to))
    }

    async fn instance(&self, instance_id: i64) -> Result<SequenceInstance, NurtureError> {
        self.storage
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| NurtureError::not_found("sequence instance", instance_id.to_string()))
    }
}

fn invalid_transition(instance: &SequenceInstance, to: InstanceStatus) -> NurtureError {
    NurtureError::InvalidTransition {
        entity: "sequence instance",
        id: instance.id.to_string(),
        from: instance.status.to_string(),
        to: to.to_string(),
    }
}

/// The trigger payload as an object; scalars are kept under `payload`.
fn execution_context(payload: &Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => Map::from_iter([("payload".to_string(), other.clone())]),
    }
}
