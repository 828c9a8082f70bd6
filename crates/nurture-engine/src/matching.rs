// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pure participant-to-user scoring.
//!
//! Nothing here touches storage: given a participant record, the meeting
//! window, the confirmed mappings and a candidate user, [`score_candidate`]
//! returns a confidence in `[0, 1]`, and [`select_match`] turns the scores of
//! all candidates into a decision. Name, domain and timing evidence is scaled
//! below the exact-email floor, so an exact email is decisive.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use nurture_config::model::CorrelationConfig;
use nurture_core::models::{ParticipantRecord, User};

/// Weights and thresholds of the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPolicy {
    pub acceptance_threshold: f64,
    pub tie_epsilon: f64,
    pub exact_email_floor: f64,
    pub name_weight: f64,
    pub domain_weight: f64,
    pub temporal_weight: f64,
    /// How long before the scheduled start a join still counts as on time.
    pub join_grace: TimeDelta,
    /// Distance outside the window over which the temporal score decays to 0.
    pub temporal_horizon: TimeDelta,
}

impl From<&CorrelationConfig> for MatchPolicy {
    fn from(config: &CorrelationConfig) -> Self {
        Self {
            acceptance_threshold: config.acceptance_threshold,
            tie_epsilon: config.tie_epsilon,
            exact_email_floor: config.exact_email_floor,
            name_weight: config.name_weight,
            domain_weight: config.domain_weight,
            temporal_weight: config.temporal_weight,
            join_grace: TimeDelta::seconds(config.join_grace_secs),
            temporal_horizon: TimeDelta::seconds(config.temporal_horizon_secs),
        }
    }
}

impl MatchPolicy {
    /// Upper bound of a score without an exact email or a confirmed mapping.
    ///
    /// It sits `tie_epsilon` under the email floor, so a same-named colleague
    /// on the same domain never ties with the participant's exact email.
    pub fn non_email_ceiling(&self) -> f64 {
        (self.exact_email_floor - self.tie_epsilon).max(0.0)
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::from(&CorrelationConfig::default())
    }
}

/// Scheduled start and end of a meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeetingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Why a participant record was left unmatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    NoCandidates,
    BelowThreshold,
    /// Two candidates scored within the tie epsilon of each other.
    Ambiguous,
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoCandidates => "no_candidates",
            Self::BelowThreshold => "below_threshold",
            Self::Ambiguous => "ambiguous",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Matched { user_id: String, score: f64 },
    Unmatched { reason: UnmatchedReason, best_score: f64 },
}

/// Lowercase, keep letters and digits, collapse everything else to single spaces.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// The key confirmed mappings are stored under: the email when present,
/// otherwise the normalized display name.
pub fn identity_key(record: &ParticipantRecord) -> String {
    if let Some(email) = record.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        return format!("email:{}", email.to_lowercase());
    }
    let name = record
        .display_name
        .as_deref()
        .map(normalize_name)
        .unwrap_or_default();
    if name.is_empty() {
        "anonymous".to_string()
    } else {
        format!("name:{name}")
    }
}

/// Unique per meeting: the identity plus the join time.
pub fn participant_key(identity_key: &str, record: &ParticipantRecord) -> String {
    format!("{identity_key}#{}", record.join_time.to_rfc3339())
}

/// Normalized Levenshtein similarity of two names; 0 when either is empty.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_name(a), normalize_name(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// 1 inside `[start - grace, end]`, decaying linearly to 0 over the horizon.
pub fn temporal_score(join: DateTime<Utc>, window: &MeetingWindow, policy: &MatchPolicy) -> f64 {
    let opens = window.start - policy.join_grace;
    let distance = if join < opens {
        opens - join
    } else if join > window.end {
        join - window.end
    } else {
        return 1.0;
    };
    let horizon = policy.temporal_horizon.num_milliseconds();
    if horizon <= 0 {
        return 0.0;
    }
    (1.0 - distance.num_milliseconds() as f64 / horizon as f64).clamp(0.0, 1.0)
}

fn email_domain(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, domain)| domain.trim())
}

/// Confidence that `record` is `candidate`.
pub fn score_candidate(
    record: &ParticipantRecord,
    identity_key: &str,
    candidate: &User,
    window: &MeetingWindow,
    mappings: &HashMap<String, String>,
    policy: &MatchPolicy,
) -> f64 {
    if mappings.get(identity_key) == Some(&candidate.user_id) {
        return 1.0;
    }

    let temporal = temporal_score(record.join_time, window, policy);
    let record_email = record.email.as_deref().map(str::trim).filter(|e| !e.is_empty());

    if let (Some(theirs), Some(ours)) = (record_email, candidate.email.as_deref())
        && theirs.eq_ignore_ascii_case(ours.trim())
    {
        let floor = policy.exact_email_floor;
        return floor + (1.0 - floor) * temporal;
    }

    let name = match (record.display_name.as_deref(), candidate.display_name.as_deref()) {
        (Some(theirs), Some(ours)) => name_similarity(theirs, ours),
        _ => 0.0,
    };
    let domain = match (record_email.and_then(email_domain), candidate.verified_domain.as_deref()) {
        (Some(theirs), Some(ours)) if theirs.eq_ignore_ascii_case(ours.trim()) => 1.0,
        _ => 0.0,
    };

    let weighted = (policy.name_weight * name
        + policy.domain_weight * domain
        + policy.temporal_weight * temporal)
        .clamp(0.0, 1.0);
    policy.non_email_ceiling() * weighted
}

/// Pick the winner among `(user_id, score)` pairs.
///
/// The best score must reach the acceptance threshold and beat the runner-up
/// by more than the tie epsilon. Ties on score are broken by user id so the
/// reported best is deterministic.
pub fn select_match(scores: &[(String, f64)], policy: &MatchPolicy) -> MatchDecision {
    let mut ranked: Vec<&(String, f64)> = scores.iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let Some((best_id, best)) = ranked.first().map(|(id, s)| (id, *s)) else {
        return MatchDecision::Unmatched {
            reason: UnmatchedReason::NoCandidates,
            best_score: 0.0,
        };
    };
    if best < policy.acceptance_threshold {
        return MatchDecision::Unmatched {
            reason: UnmatchedReason::BelowThreshold,
            best_score: best,
        };
    }
    if let Some((_, runner_up)) = ranked.get(1)
        && best - runner_up <= policy.tie_epsilon
    {
        return MatchDecision::Unmatched {
            reason: UnmatchedReason::Ambiguous,
            best_score: best,
        };
    }
    MatchDecision::Matched {
        user_id: best_id.clone(),
        score: best,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn window() -> MeetingWindow {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        MeetingWindow {
            start,
            end: start + TimeDelta::hours(1),
        }
    }

    fn record(email: Option<&str>, name: Option<&str>, join: DateTime<Utc>) -> ParticipantRecord {
        ParticipantRecord {
            email: email.map(str::to_string),
            display_name: name.map(str::to_string),
            join_time: join,
            leave_time: None,
            device_type: None,
        }
    }

    fn user(id: &str, name: &str, email: &str, domain: Option<&str>) -> User {
        User {
            user_id: id.into(),
            display_name: Some(name.into()),
            email: Some(email.into()),
            verified_domain: domain.map(str::to_string),
            channel_user_id: format!("chat-{id}"),
            timezone: None,
            created_at: window().start,
        }
    }

    fn score(r: &ParticipantRecord, u: &User) -> f64 {
        let policy = MatchPolicy::default();
        score_candidate(r, &identity_key(r), u, &window(), &HashMap::new(), &policy)
    }

    #[test]
    fn identity_prefers_email_then_name() {
        let w = window().start;
        assert_eq!(identity_key(&record(Some(" Ada@X.io "), Some("Ada"), w)), "email:ada@x.io");
        assert_eq!(identity_key(&record(None, Some("  Ada  LOVELACE!"), w)), "name:ada lovelace");
        assert_eq!(identity_key(&record(None, None, w)), "anonymous");
    }

    #[test]
    fn exact_email_scores_above_floor() {
        let ada = user("ada", "Ada Lovelace", "ada@x.io", None);
        let on_time = record(Some("ADA@x.io"), None, window().start);
        assert!((score(&on_time, &ada) - 1.0).abs() < 1e-9);

        let way_late = record(Some("ada@x.io"), None, window().end + TimeDelta::hours(3));
        assert!((score(&way_late, &ada) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn confirmed_mapping_is_certain() {
        let ada = user("ada", "Ada Lovelace", "ada@x.io", None);
        let r = record(None, Some("Countess"), window().start);
        let mappings = HashMap::from([(identity_key(&r), "ada".to_string())]);
        let key = identity_key(&r);
        let policy = MatchPolicy::default();
        assert_eq!(score_candidate(&r, &key, &ada, &window(), &mappings, &policy), 1.0);
    }

    #[test]
    fn name_domain_and_time_combine() {
        let ada = user("ada", "Ada Lovelace", "ada@home.example", Some("corp.example"));
        let r = record(Some("a.lovelace@corp.example"), Some("Ada Lovelace"), window().start);
        // (0.6 * 1 + 0.25 * 1 + 0.15 * 1) scaled by 0.9 - 0.05
        assert!((score(&r, &ada) - 0.85).abs() < 1e-9);
        assert!(score(&r, &ada) >= MatchPolicy::default().acceptance_threshold);

        let r = record(None, Some("Ada Lovelace"), window().start);
        assert!((score(&r, &ada) - 0.75 * 0.85).abs() < 1e-9);
    }

    #[test]
    fn exact_email_beats_a_namesake_on_the_same_domain() {
        let js1 = user("js1", "John Smith", "john.smith@corp.example", Some("corp.example"));
        let js2 = user("js2", "John Smith", "jsmith2@corp.example", Some("corp.example"));
        let r = record(Some("john.smith@corp.example"), Some("John Smith"), window().start);

        let scores = vec![
            ("js1".to_string(), score(&r, &js1)),
            ("js2".to_string(), score(&r, &js2)),
        ];
        assert!(scores[0].1 - scores[1].1 > MatchPolicy::default().tie_epsilon);
        assert_eq!(
            select_match(&scores, &MatchPolicy::default()),
            MatchDecision::Matched { user_id: "js1".into(), score: scores[0].1 }
        );
    }

    #[test]
    fn temporal_window_and_decay() {
        let p = MatchPolicy::default();
        let w = window();
        assert_eq!(temporal_score(w.start - TimeDelta::minutes(15), &w, &p), 1.0);
        assert_eq!(temporal_score(w.end, &w, &p), 1.0);
        let half = temporal_score(w.end + TimeDelta::minutes(30), &w, &p);
        assert!((half - 0.5).abs() < 1e-9);
        assert_eq!(temporal_score(w.start - TimeDelta::hours(3), &w, &p), 0.0);
    }

    #[test]
    fn selection_requires_threshold_and_margin() {
        let p = MatchPolicy::default();
        let s = |pairs: &[(&str, f64)]| -> Vec<(String, f64)> {
            pairs.iter().map(|(id, v)| (id.to_string(), *v)).collect()
        };

        assert_eq!(
            select_match(&[], &p),
            MatchDecision::Unmatched { reason: UnmatchedReason::NoCandidates, best_score: 0.0 }
        );
        assert!(matches!(
            select_match(&s(&[("a", 0.79)]), &p),
            MatchDecision::Unmatched { reason: UnmatchedReason::BelowThreshold, .. }
        ));
        assert!(matches!(
            select_match(&s(&[("a", 0.92), ("b", 0.90)]), &p),
            MatchDecision::Unmatched { reason: UnmatchedReason::Ambiguous, .. }
        ));
        assert_eq!(
            select_match(&s(&[("b", 0.5), ("a", 0.95)]), &p),
            MatchDecision::Matched { user_id: "a".into(), score: 0.95 }
        );
    }

    proptest! {
        #[test]
        fn scores_stay_in_unit_interval(
            name in "[A-Za-z ]{0,24}",
            offset_mins in -600i64..600,
        ) {
            let ada = user("ada", "Ada Lovelace", "ada@x.io", Some("x.io"));
            let r = record(None, Some(&name), window().start + TimeDelta::minutes(offset_mins));
            let s = score(&r, &ada);
            prop_assert!((0.0..=1.0).contains(&s));
        }

        #[test]
        fn exact_email_outscores_any_namesake(
            name in "[A-Za-z ]{0,24}",
            offset_mins in -600i64..600,
        ) {
            let join = window().start + TimeDelta::minutes(offset_mins);
            let owner = user("owner", &name, "owner@corp.example", Some("corp.example"));
            let namesake = user("namesake", &name, "other@corp.example", Some("corp.example"));
            let r = record(Some("owner@corp.example"), Some(&name), join);
            let gap = score(&r, &owner) - score(&r, &namesake);
            prop_assert!(gap > MatchPolicy::default().tie_epsilon);
        }

        #[test]
        fn near_ties_are_never_matched(
            best in 0.8f64..1.0,
            gap in 0.0f64..0.049,
        ) {
            let p = MatchPolicy::default();
            let scores = vec![("a".to_string(), best), ("b".to_string(), best - gap)];
            let is_match = matches!(select_match(&scores, &p), MatchDecision::Matched { .. });
            prop_assert!(!is_match);
        }

        #[test]
        fn selection_ignores_input_order(
            scores in proptest::collection::vec(("[a-e]", 0.0f64..1.0), 0..6),
        ) {
            let p = MatchPolicy::default();
            let reversed: Vec<_> = scores.iter().rev().cloned().collect();
            prop_assert_eq!(select_match(&scores, &p), select_match(&reversed, &p));
        }
    }
}
