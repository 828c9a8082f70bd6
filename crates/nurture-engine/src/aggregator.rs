// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Daily delivery metrics.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeDelta, Timelike, Utc};
use nurture_core::models::DailyMetrics;
use nurture_core::{NurtureError, StorageAdapter};
use tracing::debug;

/// Recomputes `delivery_metrics_daily` rows from the queue table.
///
/// Rows are rebuilt from scratch on every refresh, so running it more often
/// than needed never inflates a counter.
pub struct MetricsAggregator {
    storage: Arc<dyn StorageAdapter + Send + Sync>,
}

impl MetricsAggregator {
    pub fn new(storage: Arc<dyn StorageAdapter + Send + Sync>) -> Self {
        Self { storage }
    }

    /// Refresh the rows for the UTC day of `now`.
    ///
    /// During the first hour after midnight the previous day is refreshed
    /// too, so messages settled just before midnight are not lost.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<Vec<DailyMetrics>, NurtureError> {
        let today = now.date_naive();
        let mut rows = Vec::new();
        if now.hour() == 0 {
            let yesterday = today - TimeDelta::days(1);
            rows.extend(self.storage.refresh_daily_metrics(yesterday, now).await?);
        }

        let current = self.storage.refresh_daily_metrics(today, now).await?;
        #[cfg(feature = "prometheus")]
        for row in &current {
            for (state, value) in [
                ("scheduled", row.scheduled),
                ("sent", row.sent),
                ("failed", row.failed),
                ("skipped", row.skipped),
            ] {
                nurture_prometheus::set_daily_metric(
                    &row.sequence_type,
                    &row.message_type,
                    state,
                    value,
                );
            }
        }
        debug!(date = %today, rows = current.len(), "daily metrics refreshed");
        rows.extend(current);
        Ok(rows)
    }

    /// Stored rows for `date`, without recomputing them.
    pub async fn daily(&self, date: NaiveDate) -> Result<Vec<DailyMetrics>, NurtureError> {
        self.storage.get_daily_metrics(date).await
    }
}

#[cfg(test)]
mod tests {
    use nurture_core::Channel;
    use nurture_test_utils::{TestHarness, fixtures};

    use super::*;
    use crate::registry::SequenceRegistry;
    use crate::scheduler::SequenceScheduler;

    fn scheduler(harness: &TestHarness) -> SequenceScheduler {
        let registry = Arc::new(SequenceRegistry::from_config(&harness.config.sequences).unwrap());
        SequenceScheduler::new(harness.storage.clone(), registry, &harness.config.retry)
    }

    #[tokio::test]
    async fn refresh_counts_and_is_idempotent() {
        let harness = TestHarness::builder().build().await.unwrap();
        harness.add_user("ada").await.unwrap();
        harness.add_user("grace").await.unwrap();
        let scheduler = scheduler(&harness);
        let now = fixtures::t0();
        for user in ["ada", "ada", "grace"] {
            scheduler
                .enqueue_ad_hoc(user, "hello", Channel::Chat, 5, now, now)
                .await
                .unwrap();
        }

        let aggregator = MetricsAggregator::new(harness.storage.clone());
        let first = aggregator.refresh(now).await.unwrap();
        let second = aggregator.refresh(now).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].scheduled, 3);
        assert_eq!(first[0].sent, 0);
        assert_eq!(first[0].unique_users, 2);
        assert_eq!(first[0].message_type, "chat");

        assert_eq!(aggregator.daily(now.date_naive()).await.unwrap(), first);
    }

    #[tokio::test]
    async fn just_after_midnight_refreshes_yesterday() {
        let harness = TestHarness::builder().build().await.unwrap();
        harness.add_user("ada").await.unwrap();
        let scheduler = scheduler(&harness);
        let evening = fixtures::t0().date_naive().and_hms_opt(23, 50, 0).unwrap().and_utc();
        scheduler
            .enqueue_ad_hoc("ada", "late", Channel::Chat, 5, evening, evening)
            .await
            .unwrap();

        let aggregator = MetricsAggregator::new(harness.storage.clone());
        let rows = aggregator.refresh(evening + TimeDelta::minutes(20)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metric_date, evening.date_naive());

        let rows = aggregator.refresh(evening + TimeDelta::hours(2)).await.unwrap();
        assert!(rows.is_empty());
    }
}
