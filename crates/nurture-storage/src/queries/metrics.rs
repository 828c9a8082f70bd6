// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Daily delivery metrics and the retention sweep.

use chrono::{DateTime, NaiveDate, Utc};
use nurture_core::NurtureError;
use rusqlite::{Connection, Row, params};

use crate::database::{Database, map_tr_err};
use crate::models::{DailyMetrics, SweepReport, date_col, format_date, format_ts, ts_col};

fn row_to_metrics(row: &Row<'_>) -> rusqlite::Result<DailyMetrics> {
    let count = |idx: usize| -> rusqlite::Result<u64> {
        let raw: i64 = row.get(idx)?;
        Ok(u64::try_from(raw).unwrap_or_default())
    };
    Ok(DailyMetrics {
        metric_date: date_col(row, 0)?,
        sequence_type: row.get(1)?,
        message_type: row.get(2)?,
        scheduled: count(3)?,
        sent: count(4)?,
        failed: count(5)?,
        skipped: count(6)?,
        unique_users: count(7)?,
        updated_at: ts_col(row, 8)?,
    })
}

fn select_metrics(conn: &Connection, date: &str) -> rusqlite::Result<Vec<DailyMetrics>> {
    let mut stmt = conn.prepare(
        "SELECT metric_date, sequence_type, message_type, scheduled, sent, failed, skipped,
                unique_users, updated_at
         FROM delivery_metrics_daily WHERE metric_date = ?1
         ORDER BY sequence_type, message_type",
    )?;
    stmt.query_map(params![date], row_to_metrics)?
        .collect::<Result<Vec<_>, _>>()
}

/// Recompute one day's rows from the queue table and replace the stored ones.
///
/// Counts are keyed by the day of each timestamp: `scheduled` by `created_at`,
/// `sent`/`failed`/`skipped` by their own stamps. `unique_users` counts users
/// with any of those on the day. Running it twice yields the same rows.
pub async fn refresh_daily_metrics(
    db: &Database,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Vec<DailyMetrics>, NurtureError> {
    let date = format_date(date);
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM delivery_metrics_daily WHERE metric_date = ?1",
                params![date],
            )?;
            tx.execute(
                "INSERT INTO delivery_metrics_daily
                    (metric_date, sequence_type, message_type, scheduled, sent, failed,
                     skipped, unique_users, updated_at)
                 SELECT ?1, sequence_type, channel,
                        SUM(CASE WHEN substr(created_at, 1, 10) = ?1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN substr(sent_at, 1, 10) = ?1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN substr(failed_at, 1, 10) = ?1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN substr(skipped_at, 1, 10) = ?1 THEN 1 ELSE 0 END),
                        COUNT(DISTINCT user_id),
                        ?2
                 FROM queued_messages
                 WHERE substr(created_at, 1, 10) = ?1
                    OR substr(sent_at, 1, 10) = ?1
                    OR substr(failed_at, 1, 10) = ?1
                    OR substr(skipped_at, 1, 10) = ?1
                 GROUP BY sequence_type, channel",
                params![date, format_ts(&now)],
            )?;
            let rows = select_metrics(&tx, &date)?;
            tx.commit()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn get_daily_metrics(
    db: &Database,
    date: NaiveDate,
) -> Result<Vec<DailyMetrics>, NurtureError> {
    let date = format_date(date);
    db.connection()
        .call(move |conn| select_metrics(conn, &date))
        .await
        .map_err(map_tr_err)
}

/// Delete terminal messages and metrics rows past their cutoffs and expired leases.
///
/// A message still claimed before `message_cutoff` whose instance is no
/// longer active was abandoned by its worker; it is settled as skipped so
/// a later sweep can remove it.
pub async fn sweep_retention(
    db: &Database,
    message_cutoff: DateTime<Utc>,
    metrics_cutoff: NaiveDate,
    now: DateTime<Utc>,
) -> Result<SweepReport, NurtureError> {
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE queued_messages
                 SET skipped_at = ?2, claimed_at = NULL, claim_token = NULL,
                     error_message = (SELECT i.error_message FROM sequence_instances i
                                      WHERE i.id = queued_messages.sequence_instance_id)
                 WHERE claim_token IS NOT NULL AND claimed_at < ?1
                   AND sent_at IS NULL AND failed_at IS NULL AND skipped_at IS NULL
                   AND EXISTS (
                       SELECT 1 FROM sequence_instances i
                       WHERE i.id = queued_messages.sequence_instance_id
                         AND i.status NOT IN ('running', 'paused'))",
                params![format_ts(&message_cutoff), format_ts(&now)],
            )?;
            let messages_deleted = tx.execute(
                "DELETE FROM queued_messages
                 WHERE COALESCE(sent_at, failed_at, skipped_at) < ?1",
                params![format_ts(&message_cutoff)],
            )?;
            let metrics_deleted = tx.execute(
                "DELETE FROM delivery_metrics_daily WHERE metric_date < ?1",
                params![format_date(metrics_cutoff)],
            )?;
            let leases_deleted = tx.execute(
                "DELETE FROM meeting_leases WHERE expires_at <= ?1",
                params![format_ts(&now)],
            )?;
            tx.commit()?;
            Ok(SweepReport {
                messages_deleted,
                metrics_deleted,
                leases_deleted,
            })
        })
        .await
        .map_err(map_tr_err)
}
