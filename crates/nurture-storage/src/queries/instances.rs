// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sequence instance lifecycle operations.
//!
//! Creation, cancellation and status changes that touch both instances and
//! their queued messages run in one transaction.

use chrono::{DateTime, Utc};
use nurture_core::{InstanceStatus, NurtureError};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;

use crate::database::{Database, map_tr_err};
use crate::models::{
    NewQueuedMessage, NewSequenceInstance, SequenceInstance, StartOutcome, enum_col, format_ts,
    json_col, opt_ts_col, ts_col, u32_col,
};
use crate::queries::queue::insert_message;

const INSTANCE_COLUMNS: &str = "id, user_id, sequence_id, sequence_type, current_step, \
     total_steps, status, started_at, next_step_at, completed_at, updated_at, \
     execution_context, error_message";

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<SequenceInstance> {
    Ok(SequenceInstance {
        id: row.get(0)?,
        user_id: row.get(1)?,
        sequence_id: row.get(2)?,
        sequence_type: row.get(3)?,
        current_step: u32_col(row, 4)?,
        total_steps: u32_col(row, 5)?,
        status: enum_col(row, 6)?,
        started_at: ts_col(row, 7)?,
        next_step_at: opt_ts_col(row, 8)?,
        completed_at: opt_ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
        execution_context: json_col(row, 11)?,
        error_message: row.get(12)?,
    })
}

/// SQL list of quoted status literals, e.g. `'running', 'paused'`.
fn status_list(statuses: &[InstanceStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Create an instance at step 0 together with its first message.
///
/// The partial unique index on active exclusive instances turns a concurrent
/// duplicate start into [`StartOutcome::AlreadyActive`]. The execution cap is
/// counted under the write lock, so concurrent starts cannot overshoot it.
pub async fn start_instance(
    db: &Database,
    instance: &NewSequenceInstance,
    first_message: &NewQueuedMessage,
) -> Result<StartOutcome, NurtureError> {
    let instance = instance.clone();
    let mut message = first_message.clone();
    db.connection()
        .call(move |conn| {
            let context = Value::Object(instance.execution_context).to_string();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(cap) = instance.max_executions {
                if instance_count(&tx, &instance.user_id, &instance.sequence_id)? >= cap {
                    return Ok(StartOutcome::ExecutionCapReached);
                }
            }
            let inserted = tx.execute(
                "INSERT INTO sequence_instances
                    (user_id, sequence_id, sequence_type, current_step, total_steps, status,
                     exclusive, started_at, next_step_at, updated_at, execution_context)
                 VALUES (?1, ?2, ?3, 0, ?4, 'running', ?5, ?6, ?7, ?6, ?8)
                 ON CONFLICT DO NOTHING",
                params![
                    instance.user_id,
                    instance.sequence_id,
                    instance.sequence_type,
                    instance.total_steps,
                    instance.exclusive,
                    format_ts(&instance.started_at),
                    format_ts(&instance.next_step_at),
                    context,
                ],
            )?;
            if inserted == 0 {
                return Ok(StartOutcome::AlreadyActive);
            }

            let instance_id = tx.last_insert_rowid();
            message.sequence_instance_id = Some(instance_id);
            message.step_index = Some(0);
            let message_id =
                insert_message(&tx, &message)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            tx.commit()?;
            Ok(StartOutcome::Started {
                instance_id,
                message_id,
            })
        })
        .await
        .map_err(map_tr_err)
}

pub async fn get_instance(db: &Database, id: i64) -> Result<Option<SequenceInstance>, NurtureError> {
    db.connection()
        .call(move |conn| {
            conn.query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM sequence_instances WHERE id = ?1"),
                params![id],
                row_to_instance,
            )
            .optional()
        })
        .await
        .map_err(map_tr_err)
}

/// The most recent running or paused instance of a sequence for a user.
pub async fn find_active_instance(
    db: &Database,
    user_id: &str,
    sequence_id: &str,
) -> Result<Option<SequenceInstance>, NurtureError> {
    let user_id = user_id.to_string();
    let sequence_id = sequence_id.to_string();
    db.connection()
        .call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM sequence_instances
                     WHERE user_id = ?1 AND sequence_id = ?2 AND status IN ('running', 'paused')
                     ORDER BY id DESC LIMIT 1"
                ),
                params![user_id, sequence_id],
                row_to_instance,
            )
            .optional()
        })
        .await
        .map_err(map_tr_err)
}

pub async fn list_instances_for_user(
    db: &Database,
    user_id: &str,
) -> Result<Vec<SequenceInstance>, NurtureError> {
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM sequence_instances
                 WHERE user_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![user_id], row_to_instance)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

/// Number of instances ever created for (user, sequence), in any status.
fn instance_count(conn: &Connection, user_id: &str, sequence_id: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM sequence_instances WHERE user_id = ?1 AND sequence_id = ?2",
        params![user_id, sequence_id],
        |row| u32_col(row, 0),
    )
}

/// Compare-and-set on the instance status.
pub async fn transition_instance(
    db: &Database,
    id: i64,
    from: &[InstanceStatus],
    to: InstanceStatus,
    now: DateTime<Utc>,
) -> Result<bool, NurtureError> {
    let from = status_list(from);
    db.connection()
        .call(move |conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE sequence_instances SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND status IN ({from})"
                ),
                params![to.to_string(), format_ts(&now), id],
            )?;
            Ok(changed > 0)
        })
        .await
        .map_err(map_tr_err)
}

/// Cancel one active instance and skip its unclaimed unsent messages.
///
/// A claimed message is left to its worker: the ack records the send
/// without advancing the cancelled instance, and a failure or release
/// settles it as skipped. Runs inside the caller's transaction. Returns
/// whether the instance was active.
fn cancel_in_tx(conn: &Connection, id: i64, reason: &str, now: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE sequence_instances
         SET status = 'cancelled', error_message = ?2, next_step_at = NULL, updated_at = ?3
         WHERE id = ?1 AND status IN ('running', 'paused')",
        params![id, reason, now],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    conn.execute(
        "UPDATE queued_messages
         SET skipped_at = ?2, error_message = ?3
         WHERE sequence_instance_id = ?1 AND claim_token IS NULL
           AND sent_at IS NULL AND failed_at IS NULL AND skipped_at IS NULL",
        params![id, now, reason],
    )?;
    Ok(true)
}

pub async fn cancel_instance(
    db: &Database,
    id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool, NurtureError> {
    let reason = reason.to_string();
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let cancelled = cancel_in_tx(&tx, id, &reason, &format_ts(&now))?;
            tx.commit()?;
            Ok(cancelled)
        })
        .await
        .map_err(map_tr_err)
}

/// Cancel every active instance of a user, optionally of one sequence type.
pub async fn cancel_active_instances(
    db: &Database,
    user_id: &str,
    sequence_type: Option<&str>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Vec<i64>, NurtureError> {
    let user_id = user_id.to_string();
    let sequence_type = sequence_type.map(str::to_string);
    let reason = reason.to_string();
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM sequence_instances
                     WHERE user_id = ?1 AND status IN ('running', 'paused')
                       AND (?2 IS NULL OR sequence_type = ?2)
                     ORDER BY id",
                )?;
                stmt.query_map(params![user_id, sequence_type], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };
            let now = format_ts(&now);
            for id in &ids {
                cancel_in_tx(&tx, *id, &reason, &now)?;
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
        .map_err(map_tr_err)
}

/// Running instances whose current step has no message row.
pub async fn list_stalled_instances(db: &Database) -> Result<Vec<SequenceInstance>, NurtureError> {
    db.connection()
        .call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM sequence_instances i
                 WHERE i.status = 'running' AND i.current_step < i.total_steps
                   AND NOT EXISTS (
                       SELECT 1 FROM queued_messages m
                       WHERE m.sequence_instance_id = i.id AND m.step_index = i.current_step
                   )
                 ORDER BY i.id"
            ))?;
            let rows = stmt
                .query_map([], row_to_instance)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AckOutcome, FailureOutcome, StepAdvance};
    use crate::queries::queue::{
        acknowledge_sent, claim_message, get_message, list_messages_for_instance,
        list_messages_for_user, record_failure,
    };
    use chrono::TimeDelta;
    use crate::queries::test_support::{new_instance, new_message, setup_db, t0};
    use nurture_core::MessageState;

    async fn count_instances(db: &Database, user: &str, seq: &str) -> u32 {
        let (user, seq) = (user.to_string(), seq.to_string());
        db.connection()
            .call(move |conn| instance_count(conn, &user, &seq))
            .await
            .unwrap()
    }

    async fn start(db: &Database, user: &str, seq: &str) -> StartOutcome {
        start_instance(db, &new_instance(user, seq, 3), &new_message(user, t0()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn start_creates_instance_and_first_message() {
        let (db, _dir) = setup_db().await;
        let StartOutcome::Started {
            instance_id,
            message_id,
        } = start(&db, "u1", "welcome").await
        else {
            panic!("expected Started");
        };

        let instance = get_instance(&db, instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.current_step, 0);
        assert_eq!(instance.total_steps, 3);

        let message = get_message(&db, message_id).await.unwrap().unwrap();
        assert_eq!(message.sequence_instance_id, Some(instance_id));
        assert_eq!(message.step_index, Some(0));
        assert_eq!(message.state(), MessageState::Pending);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_active_start_is_rejected_by_index() {
        let (db, _dir) = setup_db().await;
        assert!(matches!(
            start(&db, "u1", "welcome").await,
            StartOutcome::Started { .. }
        ));
        assert_eq!(start(&db, "u1", "welcome").await, StartOutcome::AlreadyActive);
        assert!(matches!(
            start(&db, "u2", "welcome").await,
            StartOutcome::Started { .. }
        ));
        assert_eq!(count_instances(&db, "u1", "welcome").await, 1);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_instances_bypass_the_index() {
        let (db, _dir) = setup_db().await;
        let mut instance = new_instance("u1", "tips", 1);
        instance.exclusive = false;
        for _ in 0..2 {
            let outcome = start_instance(&db, &instance, &new_message("u1", t0()))
                .await
                .unwrap();
            assert!(matches!(outcome, StartOutcome::Started { .. }));
        }
        assert_eq!(count_instances(&db, "u1", "tips").await, 2);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn execution_cap_counts_every_past_instance() {
        let (db, _dir) = setup_db().await;
        let mut instance = new_instance("u1", "tips", 1);
        instance.exclusive = false;
        instance.max_executions = Some(2);
        for _ in 0..2 {
            let outcome = start_instance(&db, &instance, &new_message("u1", t0()))
                .await
                .unwrap();
            assert!(matches!(outcome, StartOutcome::Started { .. }));
        }
        let third = start_instance(&db, &instance, &new_message("u1", t0()))
            .await
            .unwrap();
        assert_eq!(third, StartOutcome::ExecutionCapReached);
        assert_eq!(count_instances(&db, "u1", "tips").await, 2);
        assert_eq!(list_messages_for_user(&db, "u1").await.unwrap().len(), 2);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn terminal_instance_frees_the_slot() {
        let (db, _dir) = setup_db().await;
        let StartOutcome::Started { instance_id, .. } = start(&db, "u1", "welcome").await else {
            panic!("expected Started");
        };
        assert!(cancel_instance(&db, instance_id, "cancelled", t0()).await.unwrap());
        assert!(matches!(
            start(&db, "u1", "welcome").await,
            StartOutcome::Started { .. }
        ));
        assert_eq!(count_instances(&db, "u1", "welcome").await, 2);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let (db, _dir) = setup_db().await;
        let StartOutcome::Started { instance_id, .. } = start(&db, "u1", "welcome").await else {
            panic!("expected Started");
        };
        let running = [InstanceStatus::Running];
        assert!(
            transition_instance(&db, instance_id, &running, InstanceStatus::Paused, t0())
                .await
                .unwrap()
        );
        assert!(
            !transition_instance(&db, instance_id, &running, InstanceStatus::Paused, t0())
                .await
                .unwrap()
        );
        let found = find_active_instance(&db, "u1", "welcome").await.unwrap().unwrap();
        assert_eq!(found.status, InstanceStatus::Paused);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_skips_unsent_messages() {
        let (db, _dir) = setup_db().await;
        let StartOutcome::Started { instance_id, .. } = start(&db, "u1", "welcome").await else {
            panic!("expected Started");
        };
        assert!(cancel_instance(&db, instance_id, "cancelled", t0()).await.unwrap());
        assert!(!cancel_instance(&db, instance_id, "cancelled", t0()).await.unwrap());

        let messages = list_messages_for_instance(&db, instance_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].state(), MessageState::Skipped);
        assert_eq!(messages[0].error_message.as_deref(), Some("cancelled"));

        let instance = get_instance(&db, instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Cancelled);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_leaves_an_in_flight_message_to_its_worker() {
        let (db, _dir) = setup_db().await;
        let StartOutcome::Started {
            instance_id,
            message_id,
        } = start(&db, "u1", "welcome").await
        else {
            panic!("expected Started");
        };
        claim_message(&db, message_id, "tok", t0(), t0() - TimeDelta::seconds(300))
            .await
            .unwrap()
            .unwrap();
        assert!(cancel_instance(&db, instance_id, "cancelled", t0()).await.unwrap());
        let message = get_message(&db, message_id).await.unwrap().unwrap();
        assert_eq!(message.state(), MessageState::Claimed);

        // The send already went out; the ack records it without advancing.
        let advance = StepAdvance {
            instance_id,
            completed_step: 0,
            next: Some(new_message("u1", t0() + TimeDelta::hours(24))),
        };
        let outcome = acknowledge_sent(&db, message_id, "tok", t0(), Some(&advance))
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::Acknowledged { completed: false });

        let messages = list_messages_for_instance(&db, instance_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].state(), MessageState::Sent);
        let instance = get_instance(&db, instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Cancelled);
        assert_eq!(instance.current_step, 0);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_send_after_cancel_is_skipped_not_retried() {
        let (db, _dir) = setup_db().await;
        let StartOutcome::Started {
            instance_id,
            message_id,
        } = start(&db, "u1", "welcome").await
        else {
            panic!("expected Started");
        };
        claim_message(&db, message_id, "tok", t0(), t0() - TimeDelta::seconds(300))
            .await
            .unwrap()
            .unwrap();
        cancel_instance(&db, instance_id, "cancelled", t0()).await.unwrap();

        let retry_at = t0() + TimeDelta::seconds(60);
        let outcome = record_failure(&db, message_id, "tok", t0(), "boom", retry_at)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Skipped);
        let message = get_message(&db, message_id).await.unwrap().unwrap();
        assert_eq!(message.state(), MessageState::Skipped);
        assert_eq!(message.error_message.as_deref(), Some("cancelled"));
        assert_eq!(message.retry_count, 0);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_active_filters_by_sequence_type() {
        let (db, _dir) = setup_db().await;
        start(&db, "u1", "welcome").await;
        let mut other = new_instance("u1", "streak", 2);
        other.sequence_type = "engagement".to_string();
        start_instance(&db, &other, &new_message("u1", t0())).await.unwrap();

        let cancelled = cancel_active_instances(&db, "u1", Some("engagement"), "cancelled", t0())
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        assert!(find_active_instance(&db, "u1", "welcome").await.unwrap().is_some());

        let all = cancel_active_instances(&db, "u1", None, "cancelled", t0())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(find_active_instance(&db, "u1", "welcome").await.unwrap().is_none());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn stalled_instances_lack_a_current_step_message() {
        let (db, _dir) = setup_db().await;
        let StartOutcome::Started { instance_id, .. } = start(&db, "u1", "welcome").await else {
            panic!("expected Started");
        };
        assert!(list_stalled_instances(&db).await.unwrap().is_empty());

        // Simulate a crash between the step-0 ack and the step-1 enqueue.
        db.connection()
            .call(move |conn| -> Result<(), rusqlite::Error> {
                conn.execute(
                    "UPDATE sequence_instances SET current_step = 1 WHERE id = ?1",
                    params![instance_id],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let stalled = list_stalled_instances(&db).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, instance_id);
        db.close().await.unwrap();
    }
}
