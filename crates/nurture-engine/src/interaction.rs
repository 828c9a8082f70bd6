// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Short-lived per-user interaction state.
//!
//! A value is scoped to one (`user_id`, `interaction_id`) pair and expires
//! after a fixed TTL. Lookups check expiry themselves, so an entry past its
//! deadline is never handed out even before [`InteractionContexts::purge_expired`]
//! has run.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

type Key = (String, String);

/// What a delivered message was about, kept so a reply to it can be acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub message_id: i64,
    pub sequence_type: String,
    pub sequence_instance_id: Option<i64>,
}

/// Interaction id under which a delivered message's context is stored.
pub fn interaction_id(message_id: i64) -> String {
    format!("msg-{message_id}")
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Expiring map of interaction contexts.
#[derive(Debug)]
pub struct InteractionContexts<V> {
    entries: DashMap<Key, Entry<V>>,
    ttl: TimeDelta,
}

impl<V: Clone> InteractionContexts<V> {
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Store `value`, replacing any previous context for the same pair.
    pub fn put(&self, user_id: &str, interaction_id: &str, value: V, now: DateTime<Utc>) {
        self.entries.insert(
            (user_id.to_string(), interaction_id.to_string()),
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn get(&self, user_id: &str, interaction_id: &str, now: DateTime<Utc>) -> Option<V> {
        let key = (user_id.to_string(), interaction_id.to_string());
        let live = self
            .entries
            .get(&key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());
        if live.is_none() {
            self.entries.remove_if(&key, |_, entry| entry.expires_at <= now);
        }
        live
    }

    /// Remove and return a live context. Each context can be taken once.
    pub fn take(&self, user_id: &str, interaction_id: &str, now: DateTime<Utc>) -> Option<V> {
        let key = (user_id.to_string(), interaction_id.to_string());
        self.entries
            .remove(&key)
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(_, entry)| entry.value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Stored entries, expired ones included until the next purge.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    #[test]
    fn contexts_are_scoped_per_user_and_interaction() {
        let contexts = InteractionContexts::new(TimeDelta::minutes(10));
        contexts.put("ada", "msg-1", "onboarding", t0());
        contexts.put("ada", "msg-2", "engagement", t0());

        assert_eq!(contexts.get("ada", "msg-1", t0()), Some("onboarding"));
        assert_eq!(contexts.get("grace", "msg-1", t0()), None);
        assert_eq!(contexts.take("ada", "msg-2", t0()), Some("engagement"));
        assert_eq!(contexts.take("ada", "msg-2", t0()), None);
        assert_eq!(contexts.len(), 1);
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let contexts = InteractionContexts::new(TimeDelta::minutes(10));
        contexts.put("ada", "msg-1", 1, t0());
        contexts.put("ada", "msg-2", 2, t0() + TimeDelta::minutes(5));

        let later = t0() + TimeDelta::minutes(10);
        assert_eq!(contexts.get("ada", "msg-1", later), None);
        assert_eq!(contexts.take("ada", "msg-1", later), None);
        assert_eq!(contexts.get("ada", "msg-2", later), Some(2));

        assert_eq!(contexts.purge_expired(t0() + TimeDelta::minutes(20)), 1);
        assert!(contexts.is_empty());
    }

    #[test]
    fn put_refreshes_the_deadline() {
        let contexts = InteractionContexts::new(TimeDelta::minutes(10));
        contexts.put("ada", "msg-1", 'a', t0());
        contexts.put("ada", "msg-1", 'b', t0() + TimeDelta::minutes(8));
        assert_eq!(contexts.get("ada", "msg-1", t0() + TimeDelta::minutes(15)), Some('b'));
    }
}
