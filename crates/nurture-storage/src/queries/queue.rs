// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable message queue with claim tokens.
//!
//! A worker claims a row with one conditional `UPDATE`; every later write
//! (ack, failure, skip, release) is conditioned on the same token. A claim
//! older than the claim TTL may be taken over, after which the original
//! holder's writes match zero rows and are reported as lost.

use chrono::{DateTime, Utc};
use nurture_core::NurtureError;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::database::{Database, map_tr_err};
use crate::models::{
    AckOutcome, FailureOutcome, NewQueuedMessage, QueuedMessage, StepAdvance, enum_col,
    format_ts, opt_ts_col, ts_col, u32_col,
};

const MESSAGE_COLUMNS: &str = "id, user_id, sequence_instance_id, step_index, sequence_type, \
     channel, channel_user_id, content, priority, scheduled_for, created_at, sent_at, \
     failed_at, skipped_at, retry_count, max_retries, claimed_at, claim_token, error_message";

/// Unsent, unfailed, unskipped.
const OPEN: &str = "sent_at IS NULL AND failed_at IS NULL AND skipped_at IS NULL";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let step_index: Option<i64> = row.get(3)?;
    let priority: i64 = row.get(8)?;
    Ok(QueuedMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        sequence_instance_id: row.get(2)?,
        step_index: step_index
            .map(|_| u32_col(row, 3))
            .transpose()?,
        sequence_type: row.get(4)?,
        channel: enum_col(row, 5)?,
        channel_user_id: row.get(6)?,
        content: row.get(7)?,
        priority: u8::try_from(priority).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Integer, Box::new(e))
        })?,
        scheduled_for: ts_col(row, 9)?,
        created_at: ts_col(row, 10)?,
        sent_at: opt_ts_col(row, 11)?,
        failed_at: opt_ts_col(row, 12)?,
        skipped_at: opt_ts_col(row, 13)?,
        retry_count: u32_col(row, 14)?,
        max_retries: u32_col(row, 15)?,
        claimed_at: opt_ts_col(row, 16)?,
        claim_token: row.get(17)?,
        error_message: row.get(18)?,
    })
}

/// Insert a message unless one already exists for the same instance step.
pub(crate) fn insert_message(
    conn: &Connection,
    message: &NewQueuedMessage,
) -> rusqlite::Result<Option<i64>> {
    let inserted = conn.execute(
        "INSERT INTO queued_messages
            (user_id, sequence_instance_id, step_index, sequence_type, channel,
             channel_user_id, content, priority, scheduled_for, created_at, max_retries)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT DO NOTHING",
        params![
            message.user_id,
            message.sequence_instance_id,
            message.step_index,
            message.sequence_type,
            message.channel.to_string(),
            message.channel_user_id,
            message.content,
            message.priority,
            format_ts(&message.scheduled_for),
            format_ts(&message.created_at),
            message.max_retries,
        ],
    )?;
    Ok((inserted > 0).then(|| conn.last_insert_rowid()))
}

fn select_message(conn: &Connection, id: i64) -> rusqlite::Result<Option<QueuedMessage>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM queued_messages WHERE id = ?1"),
        params![id],
        row_to_message,
    )
    .optional()
}

pub async fn enqueue_message(
    db: &Database,
    message: &NewQueuedMessage,
) -> Result<Option<i64>, NurtureError> {
    let message = message.clone();
    db.connection()
        .call(move |conn| insert_message(conn, &message))
        .await
        .map_err(map_tr_err)
}

pub async fn get_message(db: &Database, id: i64) -> Result<Option<QueuedMessage>, NurtureError> {
    db.connection()
        .call(move |conn| select_message(conn, id))
        .await
        .map_err(map_tr_err)
}

/// Messages of an instance in step order.
pub async fn list_messages_for_instance(
    db: &Database,
    instance_id: i64,
) -> Result<Vec<QueuedMessage>, NurtureError> {
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM queued_messages
                 WHERE sequence_instance_id = ?1 ORDER BY step_index, id"
            ))?;
            let rows = stmt
                .query_map(params![instance_id], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn list_messages_for_user(
    db: &Database,
    user_id: &str,
) -> Result<Vec<QueuedMessage>, NurtureError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM queued_messages
                 WHERE user_id = ?1 ORDER BY scheduled_for, id"
            ))?;
            let rows = stmt
                .query_map(params![user_id], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

/// Ids of deliverable messages due at `now`, highest priority first.
pub async fn due_message_ids(
    db: &Database,
    now: DateTime<Utc>,
    claim_expired_before: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<i64>, NurtureError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id FROM queued_messages m
                 LEFT JOIN sequence_instances i ON i.id = m.sequence_instance_id
                 WHERE m.scheduled_for <= ?1
                   AND m.sent_at IS NULL AND m.failed_at IS NULL AND m.skipped_at IS NULL
                   AND (m.claim_token IS NULL OR m.claimed_at < ?2)
                   AND (m.sequence_instance_id IS NULL OR i.status = 'running')
                 ORDER BY m.priority ASC, m.scheduled_for ASC, m.id ASC
                 LIMIT ?3",
            )?;
            let ids = stmt
                .query_map(
                    params![format_ts(&now), format_ts(&claim_expired_before), limit],
                    |row| row.get(0),
                )?
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
        .await
        .map_err(map_tr_err)
}

/// Claim a message if it is still deliverable and unclaimed (or its claim expired).
pub async fn claim_message(
    db: &Database,
    id: i64,
    token: &str,
    now: DateTime<Utc>,
    claim_expired_before: DateTime<Utc>,
) -> Result<Option<QueuedMessage>, NurtureError> {
    let token = token.to_string();
    db.connection()
        .call(move |conn| {
            let claimed = conn.execute(
                &format!(
                    "UPDATE queued_messages SET claimed_at = ?2, claim_token = ?3
                     WHERE id = ?1 AND {OPEN} AND scheduled_for <= ?2
                       AND (claim_token IS NULL OR claimed_at < ?4)
                       AND (sequence_instance_id IS NULL OR EXISTS (
                           SELECT 1 FROM sequence_instances i
                           WHERE i.id = queued_messages.sequence_instance_id
                             AND i.status = 'running'))"
                ),
                params![
                    id,
                    format_ts(&now),
                    token,
                    format_ts(&claim_expired_before)
                ],
            )?;
            if claimed == 0 {
                return Ok(None);
            }
            select_message(conn, id)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn release_claim(
    db: &Database,
    id: i64,
    token: &str,
    now: DateTime<Utc>,
) -> Result<bool, NurtureError> {
    let token = token.to_string();
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let released = tx.execute(
                "UPDATE queued_messages SET claimed_at = NULL, claim_token = NULL
                 WHERE id = ?1 AND claim_token = ?2",
                params![id, token],
            )?;
            if released > 0 {
                settle_if_inactive(&tx, id, &format_ts(&now))?;
            }
            tx.commit()?;
            Ok(released > 0)
        })
        .await
        .map_err(map_tr_err)
}

/// Skip an open message whose instance is no longer running or paused,
/// carrying over the instance's reason.
fn settle_if_inactive(conn: &Connection, id: i64, now: &str) -> rusqlite::Result<bool> {
    let settled = conn.execute(
        &format!(
            "UPDATE queued_messages
             SET skipped_at = ?2, claimed_at = NULL, claim_token = NULL,
                 error_message = (SELECT i.error_message FROM sequence_instances i
                                  WHERE i.id = queued_messages.sequence_instance_id)
             WHERE id = ?1 AND {OPEN}
               AND EXISTS (
                   SELECT 1 FROM sequence_instances i
                   WHERE i.id = queued_messages.sequence_instance_id
                     AND i.status NOT IN ('running', 'paused'))"
        ),
        params![id, now],
    )?;
    Ok(settled > 0)
}

/// Mark a claimed message sent and apply the instance advance atomically.
///
/// The advance only applies while the instance is active and still at
/// `completed_step`, so a replayed acknowledgment cannot skip a step.
pub async fn acknowledge_sent(
    db: &Database,
    id: i64,
    token: &str,
    now: DateTime<Utc>,
    advance: Option<&StepAdvance>,
) -> Result<AckOutcome, NurtureError> {
    let token = token.to_string();
    let advance = advance.cloned();
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let now = format_ts(&now);
            let acked = tx.execute(
                &format!(
                    "UPDATE queued_messages
                     SET sent_at = ?3, claimed_at = NULL, claim_token = NULL, error_message = NULL
                     WHERE id = ?1 AND claim_token = ?2 AND {OPEN}"
                ),
                params![id, token, now],
            )?;
            if acked == 0 {
                return Ok(AckOutcome::ClaimLost);
            }

            let mut completed = false;
            if let Some(advance) = advance {
                let next_step = advance.completed_step + 1;
                match advance.next {
                    None => {
                        completed = tx.execute(
                            "UPDATE sequence_instances
                             SET status = 'completed', current_step = ?3, completed_at = ?4,
                                 next_step_at = NULL, updated_at = ?4
                             WHERE id = ?1 AND current_step = ?2
                               AND status IN ('running', 'paused')",
                            params![advance.instance_id, advance.completed_step, next_step, now],
                        )? > 0;
                    }
                    Some(next) => {
                        let moved = tx.execute(
                            "UPDATE sequence_instances
                             SET current_step = ?3, next_step_at = ?4, updated_at = ?5
                             WHERE id = ?1 AND current_step = ?2
                               AND status IN ('running', 'paused')",
                            params![
                                advance.instance_id,
                                advance.completed_step,
                                next_step,
                                format_ts(&next.scheduled_for),
                                now
                            ],
                        )?;
                        if moved > 0 {
                            insert_message(&tx, &next)?;
                        }
                    }
                }
            }

            tx.commit()?;
            Ok(AckOutcome::Acknowledged { completed })
        })
        .await
        .map_err(map_tr_err)
}

/// Count a failed attempt; reschedule below the retry limit, fail at it.
pub async fn record_failure(
    db: &Database,
    id: i64,
    token: &str,
    now: DateTime<Utc>,
    error: &str,
    retry_at: DateTime<Utc>,
) -> Result<FailureOutcome, NurtureError> {
    let token = token.to_string();
    let error = error.to_string();
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let current = tx
                .query_row(
                    &format!(
                        "SELECT retry_count, max_retries, sequence_instance_id
                         FROM queued_messages
                         WHERE id = ?1 AND claim_token = ?2 AND {OPEN}"
                    ),
                    params![id, token],
                    |row| Ok((u32_col(row, 0)?, u32_col(row, 1)?, row.get::<_, Option<i64>>(2)?)),
                )
                .optional()?;
            let Some((retry_count, max_retries, instance_id)) = current else {
                return Ok(FailureOutcome::ClaimLost);
            };
            if settle_if_inactive(&tx, id, &format_ts(&now))? {
                tx.commit()?;
                return Ok(FailureOutcome::Skipped);
            }

            let retry_count = retry_count + 1;
            let outcome = if retry_count < max_retries {
                tx.execute(
                    "UPDATE queued_messages
                     SET retry_count = ?2, scheduled_for = ?3, error_message = ?4,
                         claimed_at = NULL, claim_token = NULL
                     WHERE id = ?1",
                    params![id, retry_count, format_ts(&retry_at), error],
                )?;
                FailureOutcome::Rescheduled {
                    retry_count,
                    retry_at,
                }
            } else {
                let now = format_ts(&now);
                tx.execute(
                    "UPDATE queued_messages
                     SET retry_count = ?2, failed_at = ?3, error_message = ?4,
                         claimed_at = NULL, claim_token = NULL
                     WHERE id = ?1",
                    params![id, retry_count, now, error],
                )?;
                if let Some(instance_id) = instance_id {
                    tx.execute(
                        "UPDATE sequence_instances
                         SET status = 'failed', error_message = ?2, updated_at = ?3
                         WHERE id = ?1 AND status IN ('running', 'paused')",
                        params![instance_id, error, now],
                    )?;
                }
                FailureOutcome::Exhausted { retry_count }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
        .map_err(map_tr_err)
}

/// Skip a claimed message; a sequence message also cancels its instance.
pub async fn mark_skipped(
    db: &Database,
    id: i64,
    token: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool, NurtureError> {
    let token = token.to_string();
    let reason = reason.to_string();
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let now = format_ts(&now);
            let skipped = tx.execute(
                &format!(
                    "UPDATE queued_messages
                     SET skipped_at = ?3, error_message = ?4, claimed_at = NULL, claim_token = NULL
                     WHERE id = ?1 AND claim_token = ?2 AND {OPEN}"
                ),
                params![id, token, now, reason],
            )?;
            if skipped > 0 {
                tx.execute(
                    "UPDATE sequence_instances
                     SET status = 'cancelled', error_message = ?2, next_step_at = NULL,
                         updated_at = ?3
                     WHERE id = (SELECT sequence_instance_id FROM queued_messages WHERE id = ?1)
                       AND status IN ('running', 'paused')",
                    params![id, reason, now],
                )?;
            }
            tx.commit()?;
            Ok(skipped > 0)
        })
        .await
        .map_err(map_tr_err)
}

/// Return a failed message to the queue with a fresh retry budget.
pub async fn requeue_message(db: &Database, id: i64, now: DateTime<Utc>) -> Result<bool, NurtureError> {
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let now = format_ts(&now);
            let requeued = tx.execute(
                "UPDATE queued_messages
                 SET failed_at = NULL, retry_count = 0, scheduled_for = ?2,
                     error_message = NULL, claimed_at = NULL, claim_token = NULL
                 WHERE id = ?1 AND failed_at IS NOT NULL",
                params![id, now],
            )?;
            if requeued > 0 {
                tx.execute(
                    "UPDATE sequence_instances
                     SET status = 'running', error_message = NULL, updated_at = ?2
                     WHERE id = (SELECT sequence_instance_id FROM queued_messages WHERE id = ?1)
                       AND status = 'failed'",
                    params![id, now],
                )?;
            }
            tx.commit()?;
            Ok(requeued > 0)
        })
        .await
        .map_err(map_tr_err)
}
