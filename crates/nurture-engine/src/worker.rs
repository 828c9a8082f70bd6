// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delivery worker: claims due messages and pushes them through the channel.
//!
//! Several workers (in one process or many) may poll the same queue. Each
//! row is claimed with a fresh token; every later write is conditioned on
//! that token, so a worker that lost its claim can never overwrite the
//! result of the worker that took it over.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use nurture_config::NurtureConfig;
use nurture_core::models::{AckOutcome, FailureOutcome, QueuedMessage};
use nurture_core::{ChannelAdapter, NurtureError, OutboundMessage, StorageAdapter};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::interaction::{self, DeliveryContext, InteractionContexts};
use crate::preferences::PreferenceDecision;
use crate::scheduler::SequenceScheduler;
use crate::template;

/// Reason recorded on messages skipped because the user opted out.
pub const OPTED_OUT_REASON: &str = "opted_out";

/// Tuning knobs of a delivery worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub send_concurrency: usize,
    pub claim_ttl: TimeDelta,
    pub send_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &NurtureConfig) -> Self {
        let claim_ttl_secs = i64::try_from(config.worker.claim_ttl_secs).unwrap_or(i64::MAX);
        Self {
            batch_size: config.worker.batch_size.max(1),
            send_concurrency: config.worker.send_concurrency.max(1),
            claim_ttl: TimeDelta::try_seconds(claim_ttl_secs).unwrap_or(TimeDelta::MAX),
            send_timeout: Duration::from_secs(config.worker.send_timeout_secs),
            backoff: BackoffPolicy::from_config(&config.retry),
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    /// Rows another worker claimed first.
    pub lost_races: usize,
    pub sent: usize,
    /// Sends that completed their sequence.
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Claims handed back because the preference store was unavailable.
    pub released: usize,
    /// Claims that expired and were taken over while this worker was sending.
    pub claims_lost: usize,
    /// Rows whose processing hit a storage error.
    pub errors: usize,
}

impl TickReport {
    fn add(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::LostRace => self.lost_races += 1,
            Delivery::Sent { completed } => {
                self.sent += 1;
                if completed {
                    self.completed += 1;
                }
            }
            Delivery::Rescheduled => self.rescheduled += 1,
            Delivery::Failed => self.failed += 1,
            Delivery::Skipped => self.skipped += 1,
            Delivery::Released => self.released += 1,
            Delivery::ClaimLost => self.claims_lost += 1,
            Delivery::Error => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    LostRace,
    Sent { completed: bool },
    Rescheduled,
    Failed,
    Skipped,
    Released,
    ClaimLost,
    Error,
}

impl Delivery {
    #[cfg(feature = "prometheus")]
    fn label(self) -> &'static str {
        match self {
            Self::LostRace => "lost_race",
            Self::Sent { .. } => "sent",
            Self::Rescheduled => "rescheduled",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Released => "released",
            Self::ClaimLost => "claim_lost",
            Self::Error => "error",
        }
    }
}

/// Polls the queue and delivers due messages.
pub struct DeliveryWorker {
    id: String,
    storage: Arc<dyn StorageAdapter + Send + Sync>,
    scheduler: Arc<SequenceScheduler>,
    channel: Arc<dyn ChannelAdapter + Send + Sync>,
    settings: WorkerSettings,
    interactions: Option<Arc<InteractionContexts<DeliveryContext>>>,
}

impl DeliveryWorker {
    pub fn new(
        id: impl Into<String>,
        storage: Arc<dyn StorageAdapter + Send + Sync>,
        scheduler: Arc<SequenceScheduler>,
        channel: Arc<dyn ChannelAdapter + Send + Sync>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            storage,
            scheduler,
            channel,
            settings,
            interactions: None,
        }
    }

    /// Remember each delivered message so a reply to it can be resolved.
    pub fn with_interactions(
        mut self,
        interactions: Arc<InteractionContexts<DeliveryContext>>,
    ) -> Self {
        self.interactions = Some(interactions);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process every message due at `now`, up to the batch size.
    ///
    /// Rows are handled concurrently up to `send_concurrency`. A failure on
    /// one row is counted in the report and never aborts the others; only a
    /// failure to read the due list is returned as an error.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, NurtureError> {
        #[cfg(feature = "prometheus")]
        let started = std::time::Instant::now();
        let claim_expired_before = now - self.settings.claim_ttl;
        let due = self
            .storage
            .due_message_ids(now, claim_expired_before, self.settings.batch_size)
            .await?;

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let deliveries: Vec<Delivery> = futures::stream::iter(due)
            .map(|id| self.process(id, now, claim_expired_before))
            .buffer_unordered(self.settings.send_concurrency)
            .collect()
            .await;
        for delivery in deliveries {
            #[cfg(feature = "prometheus")]
            nurture_prometheus::record_delivery(delivery.label());
            report.add(delivery);
        }
        #[cfg(feature = "prometheus")]
        nurture_prometheus::record_tick_duration(started.elapsed().as_secs_f64());

        info!(
            worker = self.id.as_str(),
            due = report.due,
            sent = report.sent,
            rescheduled = report.rescheduled,
            failed = report.failed,
            skipped = report.skipped,
            lost_races = report.lost_races,
            "delivery tick finished"
        );
        Ok(report)
    }

    /// Tick on a fixed interval until `cancel` fires.
    ///
    /// A tick already in progress runs to completion; the per-message send
    /// timeout bounds how long that takes.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(worker = self.id.as_str(), ?interval, "delivery worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_at(Utc::now()).await {
                        error!(worker = self.id.as_str(), error = %e, "delivery tick failed");
                    }
                }
            }
        }

        info!(worker = self.id.as_str(), "delivery worker stopped");
    }

    async fn process(
        &self,
        id: i64,
        now: DateTime<Utc>,
        claim_expired_before: DateTime<Utc>,
    ) -> Delivery {
        let token = uuid::Uuid::new_v4().to_string();
        match self.deliver(id, &token, now, claim_expired_before).await {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(worker = self.id.as_str(), message_id = id, error = %e, "delivery failed");
                Delivery::Error
            }
        }
    }

    async fn deliver(
        &self,
        id: i64,
        token: &str,
        now: DateTime<Utc>,
        claim_expired_before: DateTime<Utc>,
    ) -> Result<Delivery, NurtureError> {
        let Some(message) = self
            .storage
            .claim_message(id, token, now, claim_expired_before)
            .await?
        else {
            debug!(worker = self.id.as_str(), message_id = id, "claim lost to another worker");
            return Ok(Delivery::LostRace);
        };

        match self
            .scheduler
            .preferences()
            .check(&message.user_id, &message.sequence_type)
            .await
        {
            Ok(PreferenceDecision::Allowed) => {}
            Ok(PreferenceDecision::OptedOut) => {
                let skipped = self
                    .storage
                    .mark_skipped(id, token, OPTED_OUT_REASON, now)
                    .await?;
                info!(
                    message_id = id,
                    user_id = message.user_id.as_str(),
                    "user opted out, message skipped"
                );
                return Ok(if skipped {
                    Delivery::Skipped
                } else {
                    Delivery::ClaimLost
                });
            }
            Err(e) => {
                warn!(
                    message_id = id,
                    error = %e,
                    "preference store unavailable, releasing claim"
                );
                self.storage.release_claim(id, token, now).await?;
                return Ok(Delivery::Released);
            }
        }

        let outbound = self.render(&message).await?;
        let sent = tokio::time::timeout(self.settings.send_timeout, self.channel.send(outbound)).await;
        let error = match sent {
            Ok(Ok(receipt)) => {
                debug!(message_id = id, receipt = receipt.0.as_str(), "message sent");
                return Ok(match self.scheduler.acknowledge_sent(&message, token, now).await? {
                    AckOutcome::Acknowledged { completed } => {
                        self.remember(&message, now);
                        Delivery::Sent { completed }
                    }
                    AckOutcome::ClaimLost => Delivery::ClaimLost,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => NurtureError::Timeout {
                duration: self.settings.send_timeout,
            }
            .to_string(),
        };

        let attempt = message.retry_count + 1;
        let retry_at = now + backoff_delta(self.settings.backoff.delay(attempt));
        Ok(
            match self
                .storage
                .record_failure(id, token, now, &error, retry_at)
                .await?
            {
                FailureOutcome::Rescheduled { retry_count, retry_at } => {
                    warn!(
                        message_id = id,
                        retry_count,
                        %retry_at,
                        error = error.as_str(),
                        "send failed, retry scheduled"
                    );
                    Delivery::Rescheduled
                }
                FailureOutcome::Exhausted { retry_count } => {
                    error!(
                        message_id = id,
                        retry_count,
                        error = error.as_str(),
                        "send failed, retries exhausted"
                    );
                    Delivery::Failed
                }
                FailureOutcome::Skipped => {
                    info!(
                        message_id = id,
                        error = error.as_str(),
                        "send failed after its instance was cancelled, message skipped"
                    );
                    Delivery::Skipped
                }
                FailureOutcome::ClaimLost => Delivery::ClaimLost,
            },
        )
    }

    fn remember(&self, message: &QueuedMessage, now: DateTime<Utc>) {
        if let Some(interactions) = &self.interactions {
            interactions.put(
                &message.user_id,
                &interaction::interaction_id(message.id),
                DeliveryContext {
                    message_id: message.id,
                    sequence_type: message.sequence_type.clone(),
                    sequence_instance_id: message.sequence_instance_id,
                },
                now,
            );
        }
    }

    async fn render(&self, message: &QueuedMessage) -> Result<OutboundMessage, NurtureError> {
        let instance = match message.sequence_instance_id {
            Some(instance_id) => self.storage.get_instance(instance_id).await?,
            None => None,
        };
        let context = match &instance {
            Some(instance) => template::step_context(
                &instance.execution_context,
                &message.user_id,
                message.step_index,
                Some(instance.total_steps),
            ),
            None => template::step_context(&Default::default(), &message.user_id, None, None),
        };
        Ok(OutboundMessage {
            queue_id: message.id,
            attempt: message.retry_count + 1,
            channel: message.channel,
            channel_user_id: message.channel_user_id.clone(),
            content: template::render(&message.content, &context),
        })
    }
}

fn backoff_delta(delay: Duration) -> TimeDelta {
    TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX)
}
