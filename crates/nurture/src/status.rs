// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `nurture status` command implementation.
//!
//! Reports everything the engine holds for one user: their sequence
//! instances, queued messages by state, and delivery preferences.

use std::collections::BTreeMap;
use std::sync::Arc;

use nurture_core::models::{QueuedMessage, SequenceInstance, User, UserPreference};
use nurture_core::{NurtureError, StorageAdapter};
use serde::Serialize;

use crate::admin::print_json;

/// Structured status output.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub user: User,
    pub instances: Vec<SequenceInstance>,
    /// Message counts keyed by state (pending, claimed, sent, failed, skipped).
    pub message_counts: BTreeMap<String, usize>,
    pub messages: Vec<QueuedMessage>,
    pub preferences: Vec<UserPreference>,
}

/// Collect the status of `user_id`.
pub async fn collect_status(
    storage: &Arc<dyn StorageAdapter + Send + Sync>,
    user_id: &str,
) -> Result<StatusResponse, NurtureError> {
    let user = storage
        .get_user(user_id)
        .await?
        .ok_or_else(|| NurtureError::not_found("user", user_id))?;
    let instances = storage.list_instances_for_user(user_id).await?;
    let messages = storage.list_messages_for_user(user_id).await?;
    let preferences = storage.get_preferences(user_id).await?;

    let mut message_counts = BTreeMap::new();
    for message in &messages {
        *message_counts.entry(message.state().to_string()).or_insert(0) += 1;
    }

    Ok(StatusResponse {
        user,
        instances,
        message_counts,
        messages,
        preferences,
    })
}

/// Run the `nurture status` command.
pub async fn run_status(
    storage: &Arc<dyn StorageAdapter + Send + Sync>,
    user_id: &str,
) -> Result<(), NurtureError> {
    let status = collect_status(storage, user_id).await?;
    print_json(&status)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use nurture_config::model::StorageConfig;
    use nurture_core::Channel;
    use nurture_core::models::NewQueuedMessage;
    use nurture_storage::SqliteStorage;

    use super::*;

    async fn storage(dir: &tempfile::TempDir) -> Arc<dyn StorageAdapter + Send + Sync> {
        let storage = SqliteStorage::new(StorageConfig {
            database_path: dir.path().join("status.db").to_string_lossy().to_string(),
            wal_mode: true,
        });
        storage.initialize().await.unwrap();
        Arc::new(storage)
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let err = collect_status(&storage, "nobody").await.unwrap_err();
        assert!(matches!(err, NurtureError::NotFound { entity: "user", .. }));
    }

    #[tokio::test]
    async fn counts_messages_by_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        storage
            .upsert_user(&User {
                user_id: "ada".into(),
                display_name: None,
                email: None,
                verified_domain: None,
                channel_user_id: "chat-ada".into(),
                timezone: None,
                created_at: now,
            })
            .await
            .unwrap();
        for content in ["one", "two"] {
            storage
                .enqueue_message(&NewQueuedMessage {
                    user_id: "ada".into(),
                    sequence_instance_id: None,
                    step_index: None,
                    sequence_type: "ad_hoc".into(),
                    channel: Channel::Chat,
                    channel_user_id: "chat-ada".into(),
                    content: content.into(),
                    priority: 5,
                    scheduled_for: now,
                    created_at: now,
                    max_retries: 3,
                })
                .await
                .unwrap();
        }

        let status = collect_status(&storage, "ada").await.unwrap();
        assert_eq!(status.messages.len(), 2);
        assert_eq!(status.message_counts.get("pending"), Some(&2));
        assert!(status.instances.is_empty());
        assert!(status.preferences.is_empty());
    }
}
