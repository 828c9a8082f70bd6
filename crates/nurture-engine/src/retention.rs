// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retention sweep for settled queue rows, old metrics and stale leases.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use nurture_config::model::RetentionConfig;
use nurture_core::models::SweepReport;
use nurture_core::{NurtureError, StorageAdapter};
use tracing::info;

pub struct RetentionSweeper {
    storage: Arc<dyn StorageAdapter + Send + Sync>,
    message_retention: TimeDelta,
    metrics_retention: TimeDelta,
}

impl RetentionSweeper {
    pub fn new(storage: Arc<dyn StorageAdapter + Send + Sync>, config: &RetentionConfig) -> Self {
        Self {
            storage,
            message_retention: TimeDelta::days(i64::from(config.message_retention_days)),
            metrics_retention: TimeDelta::days(i64::from(config.metrics_retention_days)),
        }
    }

    /// Delete what has aged out as of `now`.
    ///
    /// Only sent, failed and skipped messages are eligible; pending rows are
    /// never removed regardless of age.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, NurtureError> {
        let message_cutoff = now - self.message_retention;
        let metrics_cutoff = (now - self.metrics_retention).date_naive();
        let report = self
            .storage
            .sweep_retention(message_cutoff, metrics_cutoff, now)
            .await?;
        if report != SweepReport::default() {
            info!(
                messages = report.messages_deleted,
                metrics = report.metrics_deleted,
                leases = report.leases_deleted,
                "retention sweep removed rows"
            );
        }
        Ok(report)
    }
}
