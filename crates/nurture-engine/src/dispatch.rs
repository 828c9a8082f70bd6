// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feeds attendance events to the scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nurture_core::models::{AttendanceEvent, TriggerEvent};
use nurture_core::{NurtureError, StorageAdapter};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::scheduler::SequenceScheduler;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Events this pass consumed.
    pub dispatched: usize,
    /// Consumed events that started at least one sequence.
    pub triggered: usize,
    /// Events taken by a concurrent dispatcher first.
    pub lost_races: usize,
    /// Events released after a scheduler error.
    pub released: usize,
}

/// Consumes unprocessed attendance events exactly once.
///
/// An event is claimed by stamping `processed_at` with a conditional update
/// before the scheduler sees it, so two dispatchers never both start
/// sequences for it.
pub struct AttendanceDispatcher {
    storage: Arc<dyn StorageAdapter + Send + Sync>,
    scheduler: Arc<SequenceScheduler>,
}

impl AttendanceDispatcher {
    pub fn new(
        storage: Arc<dyn StorageAdapter + Send + Sync>,
        scheduler: Arc<SequenceScheduler>,
    ) -> Self {
        Self { storage, scheduler }
    }

    pub async fn dispatch_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<DispatchReport, NurtureError> {
        let pending = self.storage.pending_attendance_events(limit).await?;
        let mut report = DispatchReport::default();

        for event in pending {
            if !self.storage.claim_attendance_event(event.id, now).await? {
                report.lost_races += 1;
                continue;
            }

            let trigger = trigger_for(&event);
            match self.scheduler.on_trigger_event(&trigger).await {
                Ok(outcomes) => {
                    let started = outcomes.iter().any(|(_, outcome)| outcome.is_started());
                    self.storage
                        .complete_attendance_event(event.id, started)
                        .await?;
                    report.dispatched += 1;
                    if started {
                        report.triggered += 1;
                    }
                    debug!(
                        event_id = event.id,
                        event_type = %event.event_type,
                        user_id = event.user_id.as_str(),
                        started,
                        "attendance event dispatched"
                    );
                }
                Err(e) => {
                    warn!(
                        event_id = event.id,
                        error = %e,
                        "attendance event dispatch failed, releasing"
                    );
                    self.storage.release_attendance_event(event.id).await?;
                    report.released += 1;
                }
            }
        }

        if report.dispatched > 0 || report.released > 0 {
            info!(
                dispatched = report.dispatched,
                triggered = report.triggered,
                released = report.released,
                "attendance dispatch finished"
            );
        }
        Ok(report)
    }
}

/// The trigger an attendance event stands for.
///
/// The event metadata becomes the payload, with `meeting_id` added so trigger
/// conditions and templates can refer to it.
fn trigger_for(event: &AttendanceEvent) -> TriggerEvent {
    let mut payload = match &event.metadata {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => Map::from_iter([("metadata".to_string(), other.clone())]),
    };
    payload.insert("meeting_id".into(), Value::String(event.meeting_id.clone()));
    TriggerEvent {
        user_id: event.user_id.clone(),
        trigger_type: event.event_type.trigger_type(),
        payload: Value::Object(payload),
        occurred_at: event.event_time,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use nurture_core::models::{CorrelationWrite, NewAttendanceEvent};
    use nurture_core::{AttendanceEventType, TriggerType};
    use nurture_test_utils::{TestHarness, fixtures};
    use serde_json::json;

    use super::*;
    use crate::registry::SequenceRegistry;

    async fn setup() -> (TestHarness, AttendanceDispatcher) {
        let mut missed = fixtures::sequence("missed-followup", TriggerType::MeetingMissed, &[3600]);
        missed.sequence_type = "re_engagement".into();
        missed.steps[0].content = "We missed you at {{meeting_id}}".into();
        let harness = TestHarness::builder()
            .with_sequences(vec![missed])
            .build()
            .await
            .unwrap();
        harness.add_user("ada").await.unwrap();
        harness.add_user("grace").await.unwrap();
        harness
            .storage
            .upsert_meeting(&fixtures::meeting("m1", &["ada", "grace"]))
            .await
            .unwrap();

        let registry = Arc::new(SequenceRegistry::from_config(&harness.config.sequences).unwrap());
        let scheduler = Arc::new(SequenceScheduler::new(
            harness.storage.clone(),
            registry,
            &harness.config.retry,
        ));
        let dispatcher = AttendanceDispatcher::new(harness.storage.clone(), scheduler);
        (harness, dispatcher)
    }

    async fn emit(harness: &TestHarness, events: Vec<(&str, AttendanceEventType)>) {
        let meeting = fixtures::meeting("m1", &[]);
        let write = CorrelationWrite {
            meeting_id: "m1".into(),
            correlated_at: meeting.scheduled_end,
            participants: Vec::new(),
            attendance: Vec::new(),
            events: events
                .into_iter()
                .map(|(user, event_type)| NewAttendanceEvent {
                    user_id: user.into(),
                    meeting_id: "m1".into(),
                    event_type,
                    event_time: meeting.scheduled_end,
                    metadata: json!({"lateness_secs": 0}),
                })
                .collect(),
            matched_user_ids: Vec::new(),
        };
        harness.storage.apply_correlation(&write).await.unwrap();
    }

    #[tokio::test]
    async fn missed_meeting_starts_follow_up_once() {
        let (harness, dispatcher) = setup().await;
        emit(
            &harness,
            vec![
                ("grace", AttendanceEventType::MeetingMissed),
                ("ada", AttendanceEventType::EarlyArrival),
            ],
        )
        .await;

        let now = fixtures::meeting("m1", &[]).scheduled_end + TimeDelta::minutes(1);
        let report = dispatcher.dispatch_pending(now, 10).await.unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.triggered, 1);

        let again = dispatcher.dispatch_pending(now, 10).await.unwrap();
        assert_eq!(again, DispatchReport::default());

        let events = harness.storage.list_attendance_events("m1").await.unwrap();
        for event in &events {
            assert!(event.processed_at.is_some());
            assert_eq!(
                event.nurture_triggered,
                event.event_type == AttendanceEventType::MeetingMissed
            );
        }

        let messages = harness.storage.list_messages_for_user("grace").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sequence_type, "re_engagement");
        assert_eq!(
            messages[0].scheduled_for,
            fixtures::meeting("m1", &[]).scheduled_end + TimeDelta::hours(1)
        );
        let instance = harness
            .storage
            .get_instance(messages[0].sequence_instance_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.execution_context["meeting_id"], json!("m1"));
    }

    #[test]
    fn trigger_carries_metadata_and_meeting() {
        let event = AttendanceEvent {
            id: 1,
            user_id: "ada".into(),
            meeting_id: "m9".into(),
            event_type: AttendanceEventType::LateArrival,
            event_time: fixtures::t0(),
            processed_at: None,
            nurture_triggered: false,
            metadata: json!({"lateness_secs": 420}),
            created_at: fixtures::t0(),
        };
        let trigger = trigger_for(&event);
        assert_eq!(trigger.trigger_type, TriggerType::LateArrival);
        assert_eq!(trigger.payload, json!({"lateness_secs": 420, "meeting_id": "m9"}));
        assert_eq!(trigger.occurred_at, fixtures::t0());
    }
}
