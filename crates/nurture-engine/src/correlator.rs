// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attendance correlation.
//!
//! Reconciles the participant records of a meeting against the user
//! directory, merges each matched user's sessions into one attendance
//! record and derives attendance events. A run for one meeting holds the
//! meeting lease, and its whole result is written in one transaction, so
//! runs for the same meeting never interleave and re-runs never duplicate
//! events.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use nurture_config::model::CorrelationConfig;
use nurture_core::models::{
    AttendanceRecord, CorrelationWrite, Meeting, NewAttendanceEvent, ParticipantAudit,
    ParticipantRecord,
};
use nurture_core::{AttendanceEventType, NurtureError, StorageAdapter};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::matching::{self, MatchDecision, MatchPolicy, MeetingWindow};

/// Summary of one correlation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationReport {
    pub meeting_id: String,
    /// Participant records resolved to a user.
    pub matched: usize,
    pub unmatched: usize,
    /// Events newly inserted by this run.
    pub events_emitted: usize,
}

pub struct AttendanceCorrelator {
    storage: Arc<dyn StorageAdapter + Send + Sync>,
    policy: MatchPolicy,
    early_arrival: TimeDelta,
    late_arrival: TimeDelta,
    lease_ttl: TimeDelta,
    holder: String,
}

impl AttendanceCorrelator {
    pub fn new(storage: Arc<dyn StorageAdapter + Send + Sync>, config: &CorrelationConfig) -> Self {
        Self {
            storage,
            policy: MatchPolicy::from(config),
            early_arrival: TimeDelta::seconds(config.early_arrival_secs),
            late_arrival: TimeDelta::seconds(config.late_arrival_secs),
            lease_ttl: TimeDelta::seconds(config.lease_ttl_secs),
            holder: format!("correlator-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Correlate `records` for `meeting_id`.
    ///
    /// Fails with [`NurtureError::CorrelationInProgress`] while another run
    /// holds the meeting lease.
    pub async fn correlate_meeting(
        &self,
        meeting_id: &str,
        records: Vec<ParticipantRecord>,
        now: DateTime<Utc>,
    ) -> Result<CorrelationReport, NurtureError> {
        let meeting = self
            .storage
            .get_meeting(meeting_id)
            .await?
            .ok_or_else(|| NurtureError::not_found("meeting", meeting_id))?;

        if !self
            .storage
            .acquire_meeting_lease(meeting_id, &self.holder, now, now + self.lease_ttl)
            .await?
        {
            return Err(NurtureError::CorrelationInProgress {
                meeting_id: meeting_id.to_string(),
            });
        }

        let result = self.correlate_locked(&meeting, records, now).await;
        if let Err(e) = self
            .storage
            .release_meeting_lease(meeting_id, &self.holder)
            .await
        {
            warn!(meeting_id, error = %e, "failed to release meeting lease");
        }
        result
    }

    /// Re-run correlation with the participant records stored by the last run.
    pub async fn recorrelate(
        &self,
        meeting_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CorrelationReport, NurtureError> {
        let records = self
            .storage
            .list_participants(meeting_id)
            .await?
            .into_iter()
            .map(|p| p.record)
            .collect();
        self.correlate_meeting(meeting_id, records, now).await
    }

    /// Confirm that a stored participant is `user_id`, then re-correlate.
    ///
    /// The mapping is keyed by the participant's identity, so it also applies
    /// to the same person in later meetings.
    pub async fn resolve_participant(
        &self,
        meeting_id: &str,
        participant_key: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CorrelationReport, NurtureError> {
        let participant = self
            .storage
            .list_participants(meeting_id)
            .await?
            .into_iter()
            .find(|p| p.participant_key == participant_key)
            .ok_or_else(|| NurtureError::not_found("participant", participant_key))?;
        if self.storage.get_user(user_id).await?.is_none() {
            return Err(NurtureError::not_found("user", user_id));
        }

        self.storage
            .confirm_participant_mapping(&participant.identity_key, user_id, now)
            .await?;
        info!(
            meeting_id,
            identity_key = participant.identity_key.as_str(),
            user_id,
            "participant mapping confirmed"
        );
        self.recorrelate(meeting_id, now).await
    }

    async fn correlate_locked(
        &self,
        meeting: &Meeting,
        records: Vec<ParticipantRecord>,
        now: DateTime<Utc>,
    ) -> Result<CorrelationReport, NurtureError> {
        let users = self.storage.list_users().await?;
        let mappings = self.storage.participant_mappings().await?;
        let window = MeetingWindow {
            start: meeting.scheduled_start,
            end: meeting.scheduled_end,
        };

        // Keyed by participant key: a record reported twice is scored once.
        let mut keyed = BTreeMap::new();
        for record in records {
            let identity = matching::identity_key(&record);
            let key = matching::participant_key(&identity, &record);
            keyed.insert(key, (identity, record));
        }

        let mut participants = Vec::with_capacity(keyed.len());
        let mut sessions: BTreeMap<String, Vec<(ParticipantRecord, f64)>> = BTreeMap::new();
        for (participant_key, (identity_key, record)) in keyed {
            let scores: Vec<(String, f64)> = users
                .iter()
                .map(|user| {
                    let score = matching::score_candidate(
                        &record,
                        &identity_key,
                        user,
                        &window,
                        &mappings,
                        &self.policy,
                    );
                    (user.user_id.clone(), score)
                })
                .collect();

            let (score, resolved, reason) = match matching::select_match(&scores, &self.policy) {
                MatchDecision::Matched { user_id, score } => {
                    sessions
                        .entry(user_id.clone())
                        .or_default()
                        .push((record.clone(), score));
                    (score, Some(user_id), None)
                }
                MatchDecision::Unmatched { reason, best_score } => {
                    debug!(
                        meeting_id = meeting.meeting_id.as_str(),
                        participant_key = participant_key.as_str(),
                        %reason,
                        best_score,
                        "participant left unmatched"
                    );
                    (best_score, None, Some(reason.to_string()))
                }
            };
            participants.push(ParticipantAudit {
                meeting_id: meeting.meeting_id.clone(),
                participant_key,
                identity_key,
                record,
                match_score: score,
                resolved_user_id: resolved,
                unmatched_reason: reason,
                updated_at: now,
            });
        }

        let matched_user_ids: Vec<String> = sessions.keys().cloned().collect();
        let attendance: Vec<AttendanceRecord> = sessions
            .iter()
            .map(|(user_id, sessions)| merge_sessions(meeting, user_id, sessions, now))
            .collect();

        let returning = self
            .storage
            .users_with_other_attendance(&meeting.meeting_id, &matched_user_ids)
            .await?;
        let events = self.derive_events(meeting, &attendance, &returning, now);

        let matched = participants
            .iter()
            .filter(|p| p.resolved_user_id.is_some())
            .count();
        let unmatched = participants.len() - matched;

        let write = CorrelationWrite {
            meeting_id: meeting.meeting_id.clone(),
            correlated_at: now,
            participants,
            attendance,
            events,
            matched_user_ids,
        };
        let events_emitted = self.storage.apply_correlation(&write).await?;

        #[cfg(feature = "prometheus")]
        nurture_prometheus::record_correlation(matched as u64, unmatched as u64, events_emitted as u64);

        info!(
            meeting_id = meeting.meeting_id.as_str(),
            matched,
            unmatched,
            events_emitted,
            "meeting correlated"
        );
        Ok(CorrelationReport {
            meeting_id: meeting.meeting_id.clone(),
            matched,
            unmatched,
            events_emitted,
        })
    }

    fn derive_events(
        &self,
        meeting: &Meeting,
        attendance: &[AttendanceRecord],
        returning: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<NewAttendanceEvent> {
        let mut events = Vec::new();
        let event = |record: &AttendanceRecord, event_type, event_time| NewAttendanceEvent {
            user_id: record.user_id.clone(),
            meeting_id: meeting.meeting_id.clone(),
            event_type,
            event_time,
            metadata: json!({
                "join_time": record.join_time,
                "leave_time": record.leave_time,
                "duration_secs": record.duration_secs,
                "lateness_secs": record.lateness_secs,
                "match_confidence": record.match_confidence,
                "session_count": record.session_count,
            }),
        };

        for record in attendance {
            events.push(event(record, AttendanceEventType::MeetingAttended, record.join_time));
            if !returning.contains(&record.user_id) {
                events.push(event(
                    record,
                    AttendanceEventType::FirstMeetingAttended,
                    record.join_time,
                ));
            }
            let lateness = TimeDelta::seconds(record.lateness_secs);
            if lateness <= -self.early_arrival {
                events.push(event(record, AttendanceEventType::EarlyArrival, record.join_time));
            } else if lateness >= self.late_arrival {
                events.push(event(record, AttendanceEventType::LateArrival, record.join_time));
            }
            if record.session_count > 1 {
                events.push(event(
                    record,
                    AttendanceEventType::Reconnection,
                    record.leave_time.unwrap_or(record.join_time),
                ));
            }
        }

        // Absence is only known once the meeting is over.
        if now >= meeting.scheduled_end {
            let present: HashSet<&str> = attendance.iter().map(|a| a.user_id.as_str()).collect();
            let mut invitees: Vec<&String> = meeting.invitees.iter().collect();
            invitees.sort();
            invitees.dedup();
            for user_id in invitees {
                if present.contains(user_id.as_str()) {
                    continue;
                }
                events.push(NewAttendanceEvent {
                    user_id: user_id.clone(),
                    meeting_id: meeting.meeting_id.clone(),
                    event_type: AttendanceEventType::MeetingMissed,
                    event_time: meeting.scheduled_end,
                    metadata: json!({
                        "scheduled_start": meeting.scheduled_start,
                        "scheduled_end": meeting.scheduled_end,
                    }),
                });
            }
        }
        events
    }
}

/// Merge one user's sessions: earliest join, latest leave, summed duration.
///
/// Confidence is the weakest accepted score among the sessions.
fn merge_sessions(
    meeting: &Meeting,
    user_id: &str,
    sessions: &[(ParticipantRecord, f64)],
    now: DateTime<Utc>,
) -> AttendanceRecord {
    let join_time = sessions
        .iter()
        .map(|(r, _)| r.join_time)
        .min()
        .unwrap_or(meeting.scheduled_start);
    let leave_time = sessions.iter().filter_map(|(r, _)| r.leave_time).max();
    let duration_secs = sessions
        .iter()
        .filter_map(|(r, _)| r.leave_time.map(|leave| (leave - r.join_time).num_seconds().max(0)))
        .sum();
    let match_confidence = sessions
        .iter()
        .map(|(_, score)| *score)
        .fold(f64::INFINITY, f64::min)
        .min(1.0);

    AttendanceRecord {
        meeting_id: meeting.meeting_id.clone(),
        user_id: user_id.to_string(),
        join_time,
        leave_time,
        duration_secs,
        lateness_secs: (join_time - meeting.scheduled_start).num_seconds(),
        match_confidence,
        session_count: u32::try_from(sessions.len()).unwrap_or(u32::MAX),
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use nurture_core::models::User;
    use nurture_test_utils::{TestHarness, fixtures};

    use super::*;

    async fn setup() -> (TestHarness, AttendanceCorrelator) {
        let harness = TestHarness::builder().build().await.unwrap();
        for (id, name) in [("ada", "Ada Lovelace"), ("grace", "Grace Hopper"), ("alan", "Alan Turing")] {
            harness.storage.upsert_user(&user(id, name)).await.unwrap();
        }
        harness
            .storage
            .upsert_meeting(&fixtures::meeting("m1", &["ada", "grace", "alan"]))
            .await
            .unwrap();
        let correlator = AttendanceCorrelator::new(harness.storage.clone(), &harness.config.correlation);
        (harness, correlator)
    }

    fn user(id: &str, name: &str) -> User {
        User {
            user_id: id.into(),
            display_name: Some(name.into()),
            email: Some(format!("{id}@example.com")),
            verified_domain: Some("example.com".into()),
            channel_user_id: format!("chat-{id}"),
            timezone: None,
            created_at: fixtures::t0(),
        }
    }

    fn record(email: Option<&str>, name: Option<&str>, join_mins: i64, leave_mins: i64) -> ParticipantRecord {
        let start = fixtures::meeting("m1", &[]).scheduled_start;
        ParticipantRecord {
            email: email.map(str::to_string),
            display_name: name.map(str::to_string),
            join_time: start + TimeDelta::minutes(join_mins),
            leave_time: Some(start + TimeDelta::minutes(leave_mins)),
            device_type: None,
        }
    }

    fn after_meeting() -> DateTime<Utc> {
        fixtures::meeting("m1", &[]).scheduled_end + TimeDelta::minutes(5)
    }

    fn types(events: &[nurture_core::models::AttendanceEvent], user: &str) -> Vec<AttendanceEventType> {
        let mut t: Vec<_> = events
            .iter()
            .filter(|e| e.user_id == user)
            .map(|e| e.event_type)
            .collect();
        t.sort_by_key(|e| e.to_string());
        t
    }

    #[tokio::test]
    async fn early_arrival_and_missed_invitee() {
        let (harness, correlator) = setup().await;
        let records = vec![
            record(Some("ada@example.com"), Some("Ada"), -5, 60),
            record(Some("g.hopper@example.com"), Some("Grace Hopper"), 10, 55),
        ];

        let report = correlator
            .correlate_meeting("m1", records, after_meeting())
            .await
            .unwrap();
        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 0);

        let events = harness.storage.list_attendance_events("m1").await.unwrap();
        assert_eq!(
            types(&events, "ada"),
            vec![
                AttendanceEventType::EarlyArrival,
                AttendanceEventType::FirstMeetingAttended,
                AttendanceEventType::MeetingAttended,
            ]
        );
        assert_eq!(
            types(&events, "grace"),
            vec![
                AttendanceEventType::FirstMeetingAttended,
                AttendanceEventType::LateArrival,
                AttendanceEventType::MeetingAttended,
            ]
        );
        assert_eq!(types(&events, "alan"), vec![AttendanceEventType::MeetingMissed]);
        assert_eq!(report.events_emitted, events.len());

        let attendance = harness.storage.list_attendance("m1").await.unwrap();
        let ada = attendance.iter().find(|a| a.user_id == "ada").unwrap();
        assert_eq!(ada.lateness_secs, -300);
        assert_eq!(ada.duration_secs, 65 * 60);
    }

    #[tokio::test]
    async fn joining_two_minutes_early_is_an_early_arrival() {
        let (harness, correlator) = setup().await;
        let mut just_early = record(Some("grace@example.com"), None, 0, 60);
        just_early.join_time -= TimeDelta::seconds(59);
        let records = vec![record(Some("ada@example.com"), None, -2, 60), just_early];

        correlator
            .correlate_meeting("m1", records, after_meeting())
            .await
            .unwrap();

        let events = harness.storage.list_attendance_events("m1").await.unwrap();
        assert!(types(&events, "ada").contains(&AttendanceEventType::EarlyArrival));
        assert!(!types(&events, "grace").contains(&AttendanceEventType::EarlyArrival));
        for user in ["ada", "grace"] {
            assert!(types(&events, user).contains(&AttendanceEventType::MeetingAttended));
        }
        let ada = harness
            .storage
            .list_attendance("m1")
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.user_id == "ada")
            .unwrap();
        assert_eq!(ada.lateness_secs, -120);
    }

    #[tokio::test]
    async fn rerun_is_deterministic_and_emits_nothing_new() {
        let (harness, correlator) = setup().await;
        let records = vec![
            record(Some("ada@example.com"), None, 0, 30),
            record(Some("ada@example.com"), None, 35, 60),
            record(None, Some("Someone Else"), 0, 60),
        ];

        let first = correlator
            .correlate_meeting("m1", records.clone(), after_meeting())
            .await
            .unwrap();
        let participants = harness.storage.list_participants("m1").await.unwrap();
        let events = harness.storage.list_attendance_events("m1").await.unwrap();

        let second = correlator
            .correlate_meeting("m1", records, after_meeting())
            .await
            .unwrap();
        assert_eq!(second.events_emitted, 0);
        assert_eq!((first.matched, first.unmatched), (second.matched, second.unmatched));

        let rerun: Vec<_> = harness
            .storage
            .list_participants("m1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.participant_key, p.resolved_user_id, p.unmatched_reason))
            .collect();
        let original: Vec<_> = participants
            .into_iter()
            .map(|p| (p.participant_key, p.resolved_user_id, p.unmatched_reason))
            .collect();
        assert_eq!(rerun, original);
        assert_eq!(harness.storage.list_attendance_events("m1").await.unwrap().len(), events.len());

        assert!(types(&events, "ada").contains(&AttendanceEventType::Reconnection));
        let ada = &harness.storage.list_attendance("m1").await.unwrap()[0];
        assert_eq!(ada.session_count, 2);
    }

    #[tokio::test]
    async fn ambiguous_names_stay_unmatched() {
        let (harness, correlator) = setup().await;
        harness
            .storage
            .upsert_user(&user("ada2", "Ada Lovelace"))
            .await
            .unwrap();

        // Same name and verified domain for both candidates, no exact email.
        let shared = record(Some("lovelace@example.com"), Some("Ada Lovelace"), 0, 60);
        let report = correlator
            .correlate_meeting("m1", vec![shared], after_meeting())
            .await
            .unwrap();
        assert_eq!(report.matched, 0);
        let participant = &harness.storage.list_participants("m1").await.unwrap()[0];
        assert_eq!(participant.unmatched_reason.as_deref(), Some("ambiguous"));
        assert!(participant.resolved_user_id.is_none());
    }

    #[tokio::test]
    async fn resolving_a_participant_withdraws_missed_event() {
        let (harness, correlator) = setup().await;
        correlator
            .correlate_meeting("m1", vec![record(None, Some("Dr. G"), 0, 60)], after_meeting())
            .await
            .unwrap();
        let events = harness.storage.list_attendance_events("m1").await.unwrap();
        assert!(types(&events, "grace").contains(&AttendanceEventType::MeetingMissed));

        let key = harness.storage.list_participants("m1").await.unwrap()[0]
            .participant_key
            .clone();
        let report = correlator
            .resolve_participant("m1", &key, "grace", after_meeting())
            .await
            .unwrap();
        assert_eq!(report.matched, 1);

        let events = harness.storage.list_attendance_events("m1").await.unwrap();
        assert!(!types(&events, "grace").contains(&AttendanceEventType::MeetingMissed));
        assert!(harness
            .storage
            .participant_mappings()
            .await
            .unwrap()
            .contains_key("name:dr g"));
    }

    #[tokio::test]
    async fn held_lease_rejects_a_second_run() {
        let (harness, correlator) = setup().await;
        let now = after_meeting();
        assert!(harness
            .storage
            .acquire_meeting_lease("m1", "other-process", now, now + TimeDelta::minutes(2))
            .await
            .unwrap());

        let err = correlator.correlate_meeting("m1", Vec::new(), now).await.unwrap_err();
        assert!(matches!(err, NurtureError::CorrelationInProgress { .. }));

        // Once the lease expires the run proceeds.
        let later = now + TimeDelta::minutes(3);
        assert!(correlator.correlate_meeting("m1", Vec::new(), later).await.is_ok());
    }

    #[tokio::test]
    async fn no_missed_events_before_the_meeting_ends() {
        let (harness, correlator) = setup().await;
        let during = fixtures::meeting("m1", &[]).scheduled_start + TimeDelta::minutes(10);
        correlator.correlate_meeting("m1", Vec::new(), during).await.unwrap();
        assert!(harness.storage.list_attendance_events("m1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_meeting_is_not_found() {
        let (_harness, correlator) = setup().await;
        let err = correlator
            .correlate_meeting("nope", Vec::new(), after_meeting())
            .await
            .unwrap_err();
        assert!(matches!(err, NurtureError::NotFound { .. }));
    }
}
