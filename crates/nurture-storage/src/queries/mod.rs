// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Query modules for operations on storage entities.

pub mod attendance;
pub mod instances;
pub mod metrics;
pub mod preferences;
pub mod queue;
pub mod users;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, TimeZone, Utc};
    use nurture_core::Channel;
    use nurture_core::models::{NewQueuedMessage, NewSequenceInstance, User};
    use tempfile::TempDir;

    use crate::database::Database;

    pub async fn setup_db() -> (Database, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        (db, dir)
    }

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    pub fn user(id: &str) -> User {
        User {
            user_id: id.to_string(),
            display_name: Some(format!("User {id}")),
            email: Some(format!("{id}@example.com")),
            verified_domain: Some("example.com".to_string()),
            channel_user_id: format!("chat-{id}"),
            timezone: None,
            created_at: t0(),
        }
    }

    pub fn new_instance(user_id: &str, sequence_id: &str, total_steps: u32) -> NewSequenceInstance {
        NewSequenceInstance {
            user_id: user_id.to_string(),
            sequence_id: sequence_id.to_string(),
            sequence_type: "onboarding".to_string(),
            total_steps,
            exclusive: true,
            max_executions: None,
            started_at: t0(),
            next_step_at: t0(),
            execution_context: serde_json::Map::new(),
        }
    }

    pub fn new_message(user_id: &str, scheduled_for: DateTime<Utc>) -> NewQueuedMessage {
        NewQueuedMessage {
            user_id: user_id.to_string(),
            sequence_instance_id: None,
            step_index: None,
            sequence_type: "onboarding".to_string(),
            channel: Channel::Chat,
            channel_user_id: format!("chat-{user_id}"),
            content: "hello".to_string(),
            priority: 5,
            scheduled_for,
            created_at: t0(),
            max_retries: 3,
        }
    }
}
