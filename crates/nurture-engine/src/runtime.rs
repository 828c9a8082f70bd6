// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wires the engine components together and runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nurture_config::NurtureConfig;
use nurture_core::models::{AD_HOC_SEQUENCE_TYPE, SweepReport};
use nurture_core::{ChannelAdapter, NurtureError, StorageAdapter};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::MetricsAggregator;
use crate::correlator::AttendanceCorrelator;
use crate::dispatch::{AttendanceDispatcher, DispatchReport};
use crate::interaction::{DeliveryContext, InteractionContexts};
use crate::registry::SequenceRegistry;
use crate::retention::RetentionSweeper;
use crate::scheduler::SequenceScheduler;
use crate::shutdown;
use crate::worker::{DeliveryWorker, WorkerSettings};

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub dispatch: DispatchReport,
    pub metrics_rows: usize,
    /// Present when the pass included a retention sweep.
    pub sweep: Option<SweepReport>,
    pub interactions_purged: usize,
}

/// The assembled engine: scheduler, workers, correlator and maintenance.
pub struct NurtureRuntime {
    config: NurtureConfig,
    storage: Arc<dyn StorageAdapter + Send + Sync>,
    channel: Arc<dyn ChannelAdapter + Send + Sync>,
    scheduler: Arc<SequenceScheduler>,
    correlator: AttendanceCorrelator,
    dispatcher: AttendanceDispatcher,
    aggregator: MetricsAggregator,
    sweeper: RetentionSweeper,
    interactions: Arc<InteractionContexts<DeliveryContext>>,
}

impl NurtureRuntime {
    /// Build the runtime. Fails when a sequence definition is invalid.
    pub fn new(
        config: NurtureConfig,
        storage: Arc<dyn StorageAdapter + Send + Sync>,
        channel: Arc<dyn ChannelAdapter + Send + Sync>,
    ) -> Result<Self, NurtureError> {
        let registry = Arc::new(SequenceRegistry::from_config(&config.sequences)?);
        info!(sequences = registry.len(), "sequence registry loaded");

        let scheduler = Arc::new(SequenceScheduler::new(
            storage.clone(),
            registry,
            &config.retry,
        ));
        let interaction_ttl = i64::try_from(config.worker.interaction_ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        Ok(Self {
            correlator: AttendanceCorrelator::new(storage.clone(), &config.correlation),
            dispatcher: AttendanceDispatcher::new(storage.clone(), scheduler.clone()),
            aggregator: MetricsAggregator::new(storage.clone()),
            sweeper: RetentionSweeper::new(storage.clone(), &config.retention),
            interactions: Arc::new(InteractionContexts::new(interaction_ttl)),
            scheduler,
            storage,
            channel,
            config,
        })
    }

    pub fn config(&self) -> &NurtureConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter + Send + Sync> {
        &self.storage
    }

    pub fn scheduler(&self) -> &Arc<SequenceScheduler> {
        &self.scheduler
    }

    pub fn correlator(&self) -> &AttendanceCorrelator {
        &self.correlator
    }

    pub fn dispatcher(&self) -> &AttendanceDispatcher {
        &self.dispatcher
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    pub fn sweeper(&self) -> &RetentionSweeper {
        &self.sweeper
    }

    pub fn interactions(&self) -> &Arc<InteractionContexts<DeliveryContext>> {
        &self.interactions
    }

    /// A delivery worker wired to this runtime's storage and channel.
    pub fn worker(&self, index: usize) -> DeliveryWorker {
        DeliveryWorker::new(
            format!("{}-worker-{index}", self.config.engine.name),
            self.storage.clone(),
            self.scheduler.clone(),
            self.channel.clone(),
            WorkerSettings::from_config(&self.config),
        )
        .with_interactions(self.interactions.clone())
    }

    /// Dispatch attendance events, refresh metrics, purge expired
    /// interactions and, when `sweep` is set, run the retention sweep.
    ///
    /// A failing step is logged and the remaining steps still run.
    pub async fn maintain(&self, now: DateTime<Utc>, sweep: bool) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self
            .dispatcher
            .dispatch_pending(now, self.config.worker.dispatch_batch_size)
            .await
        {
            Ok(dispatch) => report.dispatch = dispatch,
            Err(e) => error!(error = %e, "attendance dispatch failed"),
        }
        match self.aggregator.refresh(now).await {
            Ok(rows) => report.metrics_rows = rows.len(),
            Err(e) => error!(error = %e, "metrics refresh failed"),
        }
        if sweep {
            match self.sweeper.sweep(now).await {
                Ok(swept) => report.sweep = Some(swept),
                Err(e) => error!(error = %e, "retention sweep failed"),
            }
        }
        report.interactions_purged = self.interactions.purge_expired(now);
        report
    }

    /// Treat a reply to a delivered message as an unsubscribe request.
    ///
    /// Opts the user out of the message's sequence type (or everything, for
    /// ad hoc messages) and returns the cancelled instance ids. `None` means
    /// the interaction is unknown or expired.
    pub async fn unsubscribe_from_reply(
        &self,
        user_id: &str,
        interaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<i64>>, NurtureError> {
        let Some(context) = self.interactions.take(user_id, interaction_id, now) else {
            return Ok(None);
        };
        let sequence_type = Some(context.sequence_type.as_str())
            .filter(|t| *t != AD_HOC_SEQUENCE_TYPE);
        let cancelled = self.scheduler.opt_out(user_id, sequence_type, now).await?;
        info!(
            user_id,
            message_id = context.message_id,
            sequence_type = sequence_type.unwrap_or("*"),
            "unsubscribed by reply"
        );
        Ok(Some(cancelled))
    }

    /// Run until `cancel` fires.
    ///
    /// Recovers stalled instances first, then runs the worker pool and the
    /// maintenance loop. On cancellation workers get `drain_timeout_secs` to
    /// finish their tick. Storage is left open for the caller to close.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), NurtureError> {
        let recovered = self.scheduler.recover_stalled(Utc::now()).await?;
        if recovered > 0 {
            warn!(recovered, "re-enqueued messages of stalled instances");
        }

        let tick = Duration::from_secs(self.config.worker.tick_interval_secs);
        let mut handles = Vec::with_capacity(self.config.worker.workers);
        for index in 0..self.config.worker.workers {
            let worker = self.worker(index);
            let cancel = cancel.child_token();
            handles.push(tokio::spawn(async move { worker.run(tick, cancel).await }));
        }
        info!(workers = handles.len(), ?tick, "nurture runtime started");

        self.maintenance_loop(&cancel).await;

        let drain = Duration::from_secs(self.config.worker.drain_timeout_secs);
        if !shutdown::drain_workers(handles, drain).await {
            warn!("some workers were interrupted mid-tick; their claims expire after the claim TTL");
        }
        info!("nurture runtime stopped");
        Ok(())
    }

    async fn maintenance_loop(&self, cancel: &CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.worker.maintenance_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let sweep_every = Duration::from_secs(self.config.retention.sweep_interval_secs);
        let mut last_sweep: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sweep = last_sweep.is_none_or(|at| at.elapsed() >= sweep_every);
                    if sweep {
                        last_sweep = Some(tokio::time::Instant::now());
                    }
                    self.maintain(Utc::now(), sweep).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use nurture_core::models::TriggerEvent;
    use nurture_core::{InstanceStatus, TriggerType};
    use nurture_test_utils::{TestHarness, fixtures};
    use serde_json::json;

    use super::*;
    use crate::interaction;

    fn runtime(harness: &TestHarness) -> NurtureRuntime {
        NurtureRuntime::new(
            harness.config.clone(),
            harness.storage.clone(),
            harness.channel.clone(),
        )
        .unwrap()
    }

    fn onboarding() -> Vec<nurture_config::model::SequenceConfig> {
        vec![fixtures::sequence("welcome", TriggerType::NewUser, &[0, 86_400])]
    }

    #[tokio::test]
    async fn invalid_sequences_fail_construction() {
        let mut broken = fixtures::sequence("broken", TriggerType::NewUser, &[0]);
        broken.conditions = vec!["streak >>> 5".into()];
        let harness = TestHarness::builder()
            .with_sequences(vec![broken])
            .build()
            .await
            .unwrap();
        let result = NurtureRuntime::new(
            harness.config.clone(),
            harness.storage.clone(),
            harness.channel.clone(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reply_to_a_delivered_message_unsubscribes() {
        let harness = TestHarness::builder()
            .with_sequences(onboarding())
            .build()
            .await
            .unwrap();
        harness.add_user("ada").await.unwrap();
        let runtime = runtime(&harness);
        let t0 = fixtures::t0();
        let outcomes = runtime
            .scheduler()
            .on_trigger_event(&TriggerEvent {
                user_id: "ada".into(),
                trigger_type: TriggerType::NewUser,
                payload: json!({"name": "Ada"}),
                occurred_at: t0,
            })
            .await
            .unwrap();
        assert!(outcomes[0].1.is_started());

        let report = runtime.worker(0).tick_at(t0).await.unwrap();
        assert_eq!(report.sent, 1);
        let sent = harness.channel.sent_messages().await;
        let interaction_id = interaction::interaction_id(sent[0].queue_id);

        let cancelled = runtime
            .unsubscribe_from_reply("ada", &interaction_id, t0 + TimeDelta::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        let instance = harness.storage.get_instance(cancelled[0]).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Cancelled);

        // The context is consumed by the first reply.
        assert!(runtime
            .unsubscribe_from_reply("ada", &interaction_id, t0 + TimeDelta::minutes(6))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn maintenance_runs_every_step() {
        let harness = TestHarness::builder()
            .with_sequences(onboarding())
            .build()
            .await
            .unwrap();
        harness.add_user("ada").await.unwrap();
        let runtime = runtime(&harness);
        let t0 = fixtures::t0();
        runtime
            .scheduler()
            .on_trigger_event(&TriggerEvent {
                user_id: "ada".into(),
                trigger_type: TriggerType::NewUser,
                payload: json!({}),
                occurred_at: t0,
            })
            .await
            .unwrap();
        runtime.interactions().put("ada", "stale", DeliveryContext {
            message_id: 0,
            sequence_type: "onboarding".into(),
            sequence_instance_id: None,
        }, t0 - TimeDelta::days(30));

        let report = runtime.maintain(t0, true).await;
        assert_eq!(report.metrics_rows, 1);
        assert_eq!(report.sweep, Some(SweepReport::default()));
        assert_eq!(report.interactions_purged, 1);

        let report = runtime.maintain(t0, false).await;
        assert!(report.sweep.is_none());
    }

    #[tokio::test]
    async fn run_delivers_and_stops_on_cancel() {
        let mut sequences = onboarding();
        sequences[0].steps.truncate(1);
        let mut harness = TestHarness::builder()
            .with_sequences(sequences)
            .build()
            .await
            .unwrap();
        harness.config.worker.tick_interval_secs = 1;
        harness.config.worker.drain_timeout_secs = 5;
        harness.add_user("ada").await.unwrap();
        let runtime = Arc::new(runtime(&harness));
        runtime
            .scheduler()
            .on_trigger_event(&TriggerEvent {
                user_id: "ada".into(),
                trigger_type: TriggerType::NewUser,
                payload: json!({}),
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.run(cancel).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while harness.channel.sent_count().await == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(harness.channel.sent_count().await, 1);
    }
}
