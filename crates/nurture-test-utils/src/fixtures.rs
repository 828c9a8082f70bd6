// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed inputs shared by tests.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use nurture_config::model::{SequenceConfig, StepConfig};
use nurture_core::models::Meeting;
use nurture_core::{Channel, TriggerType};

/// Monday 2026-03-02 09:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .unwrap_or_default()
}

/// An active `onboarding` sequence with one chat step per delay.
///
/// Step content renders as "Step N of M for {{name}}".
pub fn sequence(id: &str, trigger_type: TriggerType, delays_secs: &[u64]) -> SequenceConfig {
    SequenceConfig {
        id: id.to_string(),
        name: None,
        sequence_type: "onboarding".to_string(),
        trigger_type,
        conditions: Vec::new(),
        max_executions_per_user: None,
        allow_concurrent: false,
        priority: 5,
        active: true,
        steps: delays_secs
            .iter()
            .map(|&delay_secs| StepConfig {
                content: "Step {{step_number}} of {{total_steps}} for {{name}}".to_string(),
                delay_secs,
                channel: Channel::Chat,
            })
            .collect(),
    }
}

/// A one-hour meeting starting at [`t0`].
pub fn meeting(meeting_id: &str, invitees: &[&str]) -> Meeting {
    Meeting {
        meeting_id: meeting_id.to_string(),
        title: Some("Weekly check-in".to_string()),
        scheduled_start: t0(),
        scheduled_end: t0() + TimeDelta::hours(1),
        invitees: invitees.iter().map(|s| s.to_string()).collect(),
        last_correlated_at: None,
    }
}
