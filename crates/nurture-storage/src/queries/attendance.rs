// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Meetings, participant audits, attendance records, attendance events,
//! confirmed participant mappings and per-meeting correlation leases.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use nurture_core::NurtureError;
use rusqlite::{OptionalExtension, Row, params};

use crate::database::{Database, map_tr_err};
use crate::models::{
    AttendanceEvent, AttendanceRecord, CorrelationWrite, Meeting, ParticipantAudit,
    ParticipantRecord, enum_col, format_ts, json_col, opt_ts_col, ts_col, u32_col,
};

const EVENT_COLUMNS: &str = "id, user_id, meeting_id, event_type, event_time, processed_at, \
     nurture_triggered, metadata, created_at";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<AttendanceEvent> {
    Ok(AttendanceEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        meeting_id: row.get(2)?,
        event_type: enum_col(row, 3)?,
        event_time: ts_col(row, 4)?,
        processed_at: opt_ts_col(row, 5)?,
        nurture_triggered: row.get(6)?,
        metadata: json_col(row, 7)?,
        created_at: ts_col(row, 8)?,
    })
}

/// Insert or update a meeting. `last_correlated_at` is owned by correlation runs.
pub async fn upsert_meeting(db: &Database, meeting: &Meeting) -> Result<(), NurtureError> {
    let meeting = meeting.clone();
    let invitees = serde_json::Value::from(meeting.invitees.clone()).to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO meetings (meeting_id, title, scheduled_start, scheduled_end, invitees)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (meeting_id) DO UPDATE SET
                    title = excluded.title,
                    scheduled_start = excluded.scheduled_start,
                    scheduled_end = excluded.scheduled_end,
                    invitees = excluded.invitees",
                params![
                    meeting.meeting_id,
                    meeting.title,
                    format_ts(&meeting.scheduled_start),
                    format_ts(&meeting.scheduled_end),
                    invitees,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

pub async fn get_meeting(db: &Database, meeting_id: &str) -> Result<Option<Meeting>, NurtureError> {
    let meeting_id = meeting_id.to_string();
    db.connection()
        .call(move |conn| {
            conn.query_row(
                "SELECT meeting_id, title, scheduled_start, scheduled_end, invitees,
                        last_correlated_at
                 FROM meetings WHERE meeting_id = ?1",
                params![meeting_id],
                |row| {
                    Ok(Meeting {
                        meeting_id: row.get(0)?,
                        title: row.get(1)?,
                        scheduled_start: ts_col(row, 2)?,
                        scheduled_end: ts_col(row, 3)?,
                        invitees: json_col(row, 4)?,
                        last_correlated_at: opt_ts_col(row, 5)?,
                    })
                },
            )
            .optional()
        })
        .await
        .map_err(map_tr_err)
}

pub async fn participant_mappings(db: &Database) -> Result<HashMap<String, String>, NurtureError> {
    db.connection()
        .call(|conn| {
            let mut stmt = conn.prepare("SELECT identity_key, user_id FROM participant_mappings")?;
            let mappings = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<HashMap<String, String>, _>>()?;
            Ok(mappings)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn confirm_participant_mapping(
    db: &Database,
    identity_key: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(), NurtureError> {
    let identity_key = identity_key.to_string();
    let user_id = user_id.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO participant_mappings (identity_key, user_id, confirmed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (identity_key) DO UPDATE SET
                    user_id = excluded.user_id, confirmed_at = excluded.confirmed_at",
                params![identity_key, user_id, format_ts(&now)],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Take the meeting lease when it is free, expired, or already ours.
pub async fn acquire_meeting_lease(
    db: &Database,
    meeting_id: &str,
    holder: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<bool, NurtureError> {
    let meeting_id = meeting_id.to_string();
    let holder = holder.to_string();
    db.connection()
        .call(move |conn| {
            let taken = conn.execute(
                "INSERT INTO meeting_leases (meeting_id, holder, expires_at)
                 VALUES (?1, ?2, ?4)
                 ON CONFLICT (meeting_id) DO UPDATE SET
                    holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE meeting_leases.expires_at <= ?3
                    OR meeting_leases.holder = excluded.holder",
                params![meeting_id, holder, format_ts(&now), format_ts(&expires_at)],
            )?;
            Ok(taken > 0)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn release_meeting_lease(
    db: &Database,
    meeting_id: &str,
    holder: &str,
) -> Result<(), NurtureError> {
    let meeting_id = meeting_id.to_string();
    let holder = holder.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "DELETE FROM meeting_leases WHERE meeting_id = ?1 AND holder = ?2",
                params![meeting_id, holder],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Users among `user_ids` with an attendance record for a different meeting.
pub async fn users_with_other_attendance(
    db: &Database,
    meeting_id: &str,
    user_ids: &[String],
) -> Result<HashSet<String>, NurtureError> {
    let meeting_id = meeting_id.to_string();
    let user_ids = user_ids.to_vec();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT 1 FROM attendance_records WHERE user_id = ?1 AND meeting_id <> ?2",
            )?;
            let mut found = HashSet::new();
            for user_id in user_ids {
                if stmt.exists(params![user_id, meeting_id])? {
                    found.insert(user_id);
                }
            }
            Ok(found)
        })
        .await
        .map_err(map_tr_err)
}

/// Replace a meeting's participants and attendance and insert new events.
///
/// Returns the number of events actually inserted; events already present
/// under their (user, meeting, type) key are left untouched.
pub async fn apply_correlation(db: &Database, write: &CorrelationWrite) -> Result<usize, NurtureError> {
    let write = write.clone();
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let now = format_ts(&write.correlated_at);

            tx.execute(
                "DELETE FROM meeting_participants WHERE meeting_id = ?1",
                params![write.meeting_id],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO meeting_participants
                        (meeting_id, participant_key, identity_key, email, display_name,
                         join_time, leave_time, device_type, match_score, resolved_user_id,
                         unmatched_reason, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )?;
                for p in &write.participants {
                    insert.execute(params![
                        p.meeting_id,
                        p.participant_key,
                        p.identity_key,
                        p.record.email,
                        p.record.display_name,
                        format_ts(&p.record.join_time),
                        p.record.leave_time.as_ref().map(format_ts),
                        p.record.device_type,
                        p.match_score,
                        p.resolved_user_id,
                        p.unmatched_reason,
                        format_ts(&p.updated_at),
                    ])?;
                }
            }

            tx.execute(
                "DELETE FROM attendance_records WHERE meeting_id = ?1",
                params![write.meeting_id],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO attendance_records
                        (meeting_id, user_id, join_time, leave_time, duration_secs,
                         lateness_secs, match_confidence, session_count, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for a in &write.attendance {
                    insert.execute(params![
                        a.meeting_id,
                        a.user_id,
                        format_ts(&a.join_time),
                        a.leave_time.as_ref().map(format_ts),
                        a.duration_secs,
                        a.lateness_secs,
                        a.match_confidence,
                        a.session_count,
                        format_ts(&a.updated_at),
                    ])?;
                }
            }

            {
                let mut withdraw = tx.prepare(
                    "DELETE FROM attendance_events
                     WHERE meeting_id = ?1 AND user_id = ?2
                       AND event_type = 'meeting_missed' AND processed_at IS NULL",
                )?;
                for user_id in &write.matched_user_ids {
                    withdraw.execute(params![write.meeting_id, user_id])?;
                }
            }

            let mut inserted = 0;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO attendance_events
                        (user_id, meeting_id, event_type, event_time, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (user_id, meeting_id, event_type) DO NOTHING",
                )?;
                for e in &write.events {
                    inserted += insert.execute(params![
                        e.user_id,
                        e.meeting_id,
                        e.event_type.to_string(),
                        format_ts(&e.event_time),
                        e.metadata.to_string(),
                        now,
                    ])?;
                }
            }

            tx.execute(
                "UPDATE meetings SET last_correlated_at = ?2 WHERE meeting_id = ?1",
                params![write.meeting_id, now],
            )?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn list_attendance(
    db: &Database,
    meeting_id: &str,
) -> Result<Vec<AttendanceRecord>, NurtureError> {
    let meeting_id = meeting_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT meeting_id, user_id, join_time, leave_time, duration_secs,
                        lateness_secs, match_confidence, session_count, updated_at
                 FROM attendance_records WHERE meeting_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt
                .query_map(params![meeting_id], |row| {
                    Ok(AttendanceRecord {
                        meeting_id: row.get(0)?,
                        user_id: row.get(1)?,
                        join_time: ts_col(row, 2)?,
                        leave_time: opt_ts_col(row, 3)?,
                        duration_secs: row.get(4)?,
                        lateness_secs: row.get(5)?,
                        match_confidence: row.get(6)?,
                        session_count: u32_col(row, 7)?,
                        updated_at: ts_col(row, 8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

/// Stored participant records of a meeting in join order.
pub async fn list_participants(
    db: &Database,
    meeting_id: &str,
) -> Result<Vec<ParticipantAudit>, NurtureError> {
    let meeting_id = meeting_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT meeting_id, participant_key, identity_key, email, display_name,
                        join_time, leave_time, device_type, match_score, resolved_user_id,
                        unmatched_reason, updated_at
                 FROM meeting_participants WHERE meeting_id = ?1
                 ORDER BY join_time, participant_key",
            )?;
            let rows = stmt
                .query_map(params![meeting_id], |row| {
                    Ok(ParticipantAudit {
                        meeting_id: row.get(0)?,
                        participant_key: row.get(1)?,
                        identity_key: row.get(2)?,
                        record: ParticipantRecord {
                            email: row.get(3)?,
                            display_name: row.get(4)?,
                            join_time: ts_col(row, 5)?,
                            leave_time: opt_ts_col(row, 6)?,
                            device_type: row.get(7)?,
                        },
                        match_score: row.get(8)?,
                        resolved_user_id: row.get(9)?,
                        unmatched_reason: row.get(10)?,
                        updated_at: ts_col(row, 11)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn list_attendance_events(
    db: &Database,
    meeting_id: &str,
) -> Result<Vec<AttendanceEvent>, NurtureError> {
    let meeting_id = meeting_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM attendance_events
                 WHERE meeting_id = ?1 ORDER BY user_id, event_type"
            ))?;
            let rows = stmt
                .query_map(params![meeting_id], row_to_event)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

/// Oldest unprocessed events first.
pub async fn pending_attendance_events(
    db: &Database,
    limit: usize,
) -> Result<Vec<AttendanceEvent>, NurtureError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM attendance_events
                 WHERE processed_at IS NULL ORDER BY created_at, id LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit], row_to_event)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn claim_attendance_event(
    db: &Database,
    id: i64,
    now: DateTime<Utc>,
) -> Result<bool, NurtureError> {
    db.connection()
        .call(move |conn| {
            let claimed = conn.execute(
                "UPDATE attendance_events SET processed_at = ?2
                 WHERE id = ?1 AND processed_at IS NULL",
                params![id, format_ts(&now)],
            )?;
            Ok(claimed > 0)
        })
        .await
        .map_err(map_tr_err)
}

pub async fn complete_attendance_event(
    db: &Database,
    id: i64,
    nurture_triggered: bool,
) -> Result<(), NurtureError> {
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE attendance_events SET nurture_triggered = ?2 WHERE id = ?1",
                params![id, nurture_triggered],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

pub async fn release_attendance_event(db: &Database, id: i64) -> Result<(), NurtureError> {
    db.connection()
        .call(move |conn| {
            conn.execute(
                "UPDATE attendance_events SET processed_at = NULL WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewAttendanceEvent;
    use crate::queries::test_support::{setup_db, t0};
    use chrono::TimeDelta;
    use nurture_core::AttendanceEventType;
    use serde_json::json;

    fn meeting() -> Meeting {
        Meeting {
            meeting_id: "m1".to_string(),
            title: Some("Weekly check-in".to_string()),
            scheduled_start: t0(),
            scheduled_end: t0() + TimeDelta::hours(1),
            invitees: vec!["alice".to_string(), "bob".to_string()],
            last_correlated_at: None,
        }
    }

    fn event(user: &str, event_type: AttendanceEventType) -> NewAttendanceEvent {
        NewAttendanceEvent {
            user_id: user.to_string(),
            meeting_id: "m1".to_string(),
            event_type,
            event_time: t0(),
            metadata: json!({"lateness_secs": -120}),
        }
    }

    fn write(events: Vec<NewAttendanceEvent>, matched: Vec<&str>) -> CorrelationWrite {
        let record = ParticipantRecord {
            email: Some("alice@example.com".to_string()),
            display_name: Some("Alice".to_string()),
            join_time: t0() - TimeDelta::minutes(2),
            leave_time: Some(t0() + TimeDelta::minutes(50)),
            device_type: None,
        };
        CorrelationWrite {
            meeting_id: "m1".to_string(),
            correlated_at: t0() + TimeDelta::hours(2),
            participants: vec![ParticipantAudit {
                meeting_id: "m1".to_string(),
                participant_key: "email:alice@example.com#1".to_string(),
                identity_key: "email:alice@example.com".to_string(),
                record: record.clone(),
                match_score: 0.95,
                resolved_user_id: Some("alice".to_string()),
                unmatched_reason: None,
                updated_at: t0() + TimeDelta::hours(2),
            }],
            attendance: vec![AttendanceRecord {
                meeting_id: "m1".to_string(),
                user_id: "alice".to_string(),
                join_time: record.join_time,
                leave_time: record.leave_time,
                duration_secs: 52 * 60,
                lateness_secs: -120,
                match_confidence: 0.95,
                session_count: 1,
                updated_at: t0() + TimeDelta::hours(2),
            }],
            events,
            matched_user_ids: matched.into_iter().map(str::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn meeting_round_trips_with_invitees() {
        let (db, _dir) = setup_db().await;
        upsert_meeting(&db, &meeting()).await.unwrap();
        assert_eq!(get_meeting(&db, "m1").await.unwrap().unwrap(), meeting());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn reapplying_a_correlation_never_duplicates_events() {
        let (db, _dir) = setup_db().await;
        upsert_meeting(&db, &meeting()).await.unwrap();
        let w = write(
            vec![
                event("alice", AttendanceEventType::EarlyArrival),
                event("bob", AttendanceEventType::MeetingMissed),
            ],
            vec!["alice"],
        );
        assert_eq!(apply_correlation(&db, &w).await.unwrap(), 2);
        assert_eq!(apply_correlation(&db, &w).await.unwrap(), 0);

        assert_eq!(list_attendance_events(&db, "m1").await.unwrap().len(), 2);
        assert_eq!(list_attendance(&db, "m1").await.unwrap().len(), 1);
        assert_eq!(list_participants(&db, "m1").await.unwrap().len(), 1);
        let m = get_meeting(&db, "m1").await.unwrap().unwrap();
        assert_eq!(m.last_correlated_at, Some(w.correlated_at));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn matched_users_withdraw_unprocessed_missed_events() {
        let (db, _dir) = setup_db().await;
        upsert_meeting(&db, &meeting()).await.unwrap();
        apply_correlation(&db, &write(vec![event("bob", AttendanceEventType::MeetingMissed)], vec![]))
            .await
            .unwrap();

        apply_correlation(&db, &write(vec![], vec!["bob"])).await.unwrap();
        assert!(list_attendance_events(&db, "m1").await.unwrap().is_empty());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn event_claim_is_exactly_once() {
        let (db, _dir) = setup_db().await;
        upsert_meeting(&db, &meeting()).await.unwrap();
        apply_correlation(&db, &write(vec![event("alice", AttendanceEventType::EarlyArrival)], vec!["alice"]))
            .await
            .unwrap();

        let pending = pending_attendance_events(&db, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let id = pending[0].id;
        assert_eq!(pending[0].metadata, json!({"lateness_secs": -120}));

        assert!(claim_attendance_event(&db, id, t0()).await.unwrap());
        assert!(!claim_attendance_event(&db, id, t0()).await.unwrap());
        assert!(pending_attendance_events(&db, 10).await.unwrap().is_empty());

        release_attendance_event(&db, id).await.unwrap();
        assert!(claim_attendance_event(&db, id, t0()).await.unwrap());
        complete_attendance_event(&db, id, true).await.unwrap();
        let events = list_attendance_events(&db, "m1").await.unwrap();
        assert!(events[0].nurture_triggered);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn lease_excludes_other_holders_until_expiry() {
        let (db, _dir) = setup_db().await;
        let expiry = t0() + TimeDelta::seconds(120);
        assert!(acquire_meeting_lease(&db, "m1", "a", t0(), expiry).await.unwrap());
        assert!(!acquire_meeting_lease(&db, "m1", "b", t0(), expiry).await.unwrap());
        assert!(acquire_meeting_lease(&db, "m1", "a", t0(), expiry).await.unwrap());

        let later = expiry + TimeDelta::seconds(1);
        assert!(
            acquire_meeting_lease(&db, "m1", "b", later, later + TimeDelta::seconds(120))
                .await
                .unwrap()
        );
        release_meeting_lease(&db, "m1", "a").await.unwrap();
        assert!(!acquire_meeting_lease(&db, "m1", "a", later, later).await.unwrap());
        release_meeting_lease(&db, "m1", "b").await.unwrap();
        assert!(acquire_meeting_lease(&db, "m1", "a", later, later).await.unwrap());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn other_attendance_and_mappings() {
        let (db, _dir) = setup_db().await;
        upsert_meeting(&db, &meeting()).await.unwrap();
        apply_correlation(&db, &write(vec![], vec!["alice"])).await.unwrap();

        let users = vec!["alice".to_string(), "bob".to_string()];
        assert!(users_with_other_attendance(&db, "m1", &users).await.unwrap().is_empty());
        let other = users_with_other_attendance(&db, "m2", &users).await.unwrap();
        assert!(other.contains("alice") && !other.contains("bob"));

        confirm_participant_mapping(&db, "name:al", "alice", t0()).await.unwrap();
        confirm_participant_mapping(&db, "name:al", "bob", t0()).await.unwrap();
        let mappings = participant_mappings(&db).await.unwrap();
        assert_eq!(mappings.get("name:al").map(String::as_str), Some("bob"));
        db.close().await.unwrap();
    }
}
