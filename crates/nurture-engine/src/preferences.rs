// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delivery preference checks.
//!
//! Both the global row and the row for the sequence type are consulted;
//! either one being disabled or opted out blocks delivery. Storage errors
//! are returned to the caller, which must treat them as a block.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nurture_core::models::UserPreference;
use nurture_core::{NurtureError, StorageAdapter};
use tracing::info;

/// Result of a preference check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceDecision {
    Allowed,
    OptedOut,
}

/// Reads and writes user preferences through the storage adapter.
#[derive(Clone)]
pub struct PreferenceGate {
    storage: Arc<dyn StorageAdapter + Send + Sync>,
}

impl PreferenceGate {
    pub fn new(storage: Arc<dyn StorageAdapter + Send + Sync>) -> Self {
        Self { storage }
    }

    pub async fn check(
        &self,
        user_id: &str,
        sequence_type: &str,
    ) -> Result<PreferenceDecision, NurtureError> {
        let preferences = self.storage.get_preferences(user_id).await?;
        let blocked = preferences
            .iter()
            .filter(|p| p.sequence_type.as_deref().is_none_or(|t| t == sequence_type))
            .any(UserPreference::blocks_delivery);
        Ok(if blocked {
            PreferenceDecision::OptedOut
        } else {
            PreferenceDecision::Allowed
        })
    }

    pub async fn preferences(&self, user_id: &str) -> Result<Vec<UserPreference>, NurtureError> {
        self.storage.get_preferences(user_id).await
    }

    pub async fn set_preference(&self, preference: &UserPreference) -> Result<(), NurtureError> {
        self.storage.upsert_preference(preference).await
    }

    /// Stamp `opted_out_at` on the global row or the row for `sequence_type`.
    pub async fn opt_out(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UserPreference, NurtureError> {
        let mut preference = self.current(user_id, sequence_type, now).await?;
        if preference.opted_out_at.is_none() {
            preference.opted_out_at = Some(now);
        }
        preference.updated_at = now;
        self.storage.upsert_preference(&preference).await?;
        info!(
            user_id,
            sequence_type = sequence_type.unwrap_or("*"),
            "user opted out"
        );
        Ok(preference)
    }

    /// Clear `opted_out_at` and re-enable the row.
    pub async fn opt_in(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UserPreference, NurtureError> {
        let mut preference = self.current(user_id, sequence_type, now).await?;
        preference.opted_out_at = None;
        preference.enabled = true;
        preference.updated_at = now;
        self.storage.upsert_preference(&preference).await?;
        info!(
            user_id,
            sequence_type = sequence_type.unwrap_or("*"),
            "user opted in"
        );
        Ok(preference)
    }

    async fn current(
        &self,
        user_id: &str,
        sequence_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UserPreference, NurtureError> {
        let existing = self
            .storage
            .get_preferences(user_id)
            .await?
            .into_iter()
            .find(|p| p.sequence_type.as_deref() == sequence_type);
        Ok(existing.unwrap_or_else(|| UserPreference::new(user_id, sequence_type, now)))
    }
}
