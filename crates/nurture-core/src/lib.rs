// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Nurture engine.
//!
//! This crate provides the foundational trait definitions, error type,
//! domain records and trigger condition predicates used throughout the
//! Nurture workspace. Storage and channel adapters implement traits defined here.

pub mod condition;
pub mod error;
pub mod models;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use condition::{CompareOp, TriggerCondition};
pub use error::NurtureError;
pub use types::{
    AdapterType, AttendanceEventType, Channel, HealthStatus, InstanceStatus, MessageId,
    MessageState, OutboundMessage, TriggerType,
};

pub use traits::{ChannelAdapter, PluginAdapter, StorageAdapter};

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::models::{QueuedMessage, SequenceDefinition, SequenceStep, UserPreference};

    #[test]
    fn trigger_type_uses_snake_case_everywhere() {
        assert_eq!(TriggerType::StreakMilestone.to_string(), "streak_milestone");
        assert_eq!(
            TriggerType::from_str("first_meeting_attended").unwrap(),
            TriggerType::FirstMeetingAttended
        );
        let json = serde_json::to_string(&TriggerType::NewUser).unwrap();
        assert_eq!(json, "\"new_user\"");
    }

    #[test]
    fn instance_status_activity() {
        assert!(InstanceStatus::Running.is_active());
        assert!(InstanceStatus::Paused.is_active());
        for status in [
            InstanceStatus::Completed,
            InstanceStatus::Cancelled,
            InstanceStatus::Failed,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
    }

    #[test]
    fn attendance_events_map_to_trigger_types() {
        assert_eq!(
            AttendanceEventType::MeetingMissed.trigger_type(),
            TriggerType::MeetingMissed
        );
        assert_eq!(
            AttendanceEventType::EarlyArrival.trigger_type(),
            TriggerType::EarlyArrival
        );
        assert_eq!(
            AttendanceEventType::MeetingAttended.trigger_type(),
            TriggerType::MeetingAttended
        );
    }

    #[test]
    fn message_state_follows_timestamps() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut msg = QueuedMessage {
            id: 1,
            user_id: "u1".into(),
            sequence_instance_id: None,
            step_index: None,
            sequence_type: models::AD_HOC_SEQUENCE_TYPE.into(),
            channel: Channel::Chat,
            channel_user_id: "chat-1".into(),
            content: "hi".into(),
            priority: 5,
            scheduled_for: now,
            created_at: now,
            sent_at: None,
            failed_at: None,
            skipped_at: None,
            retry_count: 0,
            max_retries: 3,
            claimed_at: None,
            claim_token: None,
            error_message: None,
        };
        assert_eq!(msg.state(), MessageState::Pending);
        msg.claim_token = Some("t".into());
        assert_eq!(msg.state(), MessageState::Claimed);
        msg.sent_at = Some(now);
        assert_eq!(msg.state(), MessageState::Sent);
    }

    #[test]
    fn definition_conditions_must_all_hold() {
        let def = SequenceDefinition {
            id: "streak-5".into(),
            name: "Streak five".into(),
            sequence_type: "engagement".into(),
            trigger_type: TriggerType::StreakMilestone,
            trigger_conditions: vec![
                "streak == 5".parse().unwrap(),
                "plan != trial".parse().unwrap(),
            ],
            steps: vec![SequenceStep {
                content_template: "Five in a row!".into(),
                delay_from_previous: chrono::TimeDelta::zero(),
                channel: Channel::Chat,
            }],
            max_executions_per_user: None,
            allow_concurrent: false,
            priority: 5,
            active: true,
        };

        assert!(def.conditions_hold(&json!({"streak": 5, "plan": "pro"})).unwrap());
        assert!(!def.conditions_hold(&json!({"streak": 5, "plan": "trial"})).unwrap());
        assert_eq!(def.total_steps(), 1);
        assert!(def.step(1).is_none());
    }

    #[test]
    fn preference_blocks_when_disabled_or_opted_out() {
        let now = Utc::now();
        let mut pref = UserPreference::new("u1", None, now);
        assert!(!pref.blocks_delivery());
        pref.opted_out_at = Some(now);
        assert!(pref.blocks_delivery());
        pref.opted_out_at = None;
        pref.enabled = false;
        assert!(pref.blocks_delivery());
    }

    #[test]
    fn error_variants_render() {
        let err = NurtureError::not_found("meeting", "m-1");
        assert_eq!(err.to_string(), "meeting not found: m-1");
        let err = NurtureError::CorrelationInProgress {
            meeting_id: "m-1".into(),
        };
        assert!(err.to_string().contains("m-1"));
    }

    #[test]
    fn all_trait_modules_are_exported() {
        fn _assert_plugin_adapter<T: PluginAdapter>() {}
        fn _assert_channel_adapter<T: ChannelAdapter>() {}
        fn _assert_storage_adapter<T: StorageAdapter>() {}
    }
}
