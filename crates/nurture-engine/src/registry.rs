// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Immutable registry of sequence definitions loaded from `[[sequences]]`.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::TimeDelta;
use nurture_config::model::SequenceConfig;
use nurture_core::models::{SequenceDefinition, SequenceStep, TriggerEvent};
use nurture_core::{NurtureError, TriggerCondition};
use tracing::{debug, warn};

/// Sequence definitions indexed by id.
#[derive(Debug, Default)]
pub struct SequenceRegistry {
    definitions: Vec<SequenceDefinition>,
    by_id: HashMap<String, usize>,
}

impl SequenceRegistry {
    /// Build the registry, rejecting anything a definition cannot run with.
    pub fn from_config(sequences: &[SequenceConfig]) -> Result<Self, NurtureError> {
        let mut registry = Self::default();
        for config in sequences {
            let definition = parse_definition(config)?;
            if registry.by_id.contains_key(&definition.id) {
                return Err(NurtureError::Config(format!(
                    "duplicate sequence id `{}`",
                    definition.id
                )));
            }
            registry
                .by_id
                .insert(definition.id.clone(), registry.definitions.len());
            registry.definitions.push(definition);
        }
        debug!(count = registry.len(), "sequence registry loaded");
        Ok(registry)
    }

    /// Active definitions whose trigger type and conditions match `event`.
    ///
    /// A definition whose conditions cannot be evaluated is logged and left
    /// out; the others are still returned.
    pub fn matching(&self, event: &TriggerEvent) -> Vec<&SequenceDefinition> {
        self.definitions
            .iter()
            .filter(|d| d.active && d.trigger_type == event.trigger_type)
            .filter(|d| match d.conditions_hold(&event.payload) {
                Ok(holds) => holds,
                Err(e) => {
                    warn!(
                        sequence_id = d.id.as_str(),
                        user_id = event.user_id.as_str(),
                        error = %e,
                        "skipping sequence: trigger conditions could not be evaluated"
                    );
                    false
                }
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&SequenceDefinition> {
        self.by_id.get(id).map(|&i| &self.definitions[i])
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn parse_definition(config: &SequenceConfig) -> Result<SequenceDefinition, NurtureError> {
    let invalid = |message: String| NurtureError::Config(format!("sequence `{}`: {message}", config.id));

    if config.id.trim().is_empty() {
        return Err(NurtureError::Config("sequence id must not be empty".into()));
    }
    if config.steps.is_empty() {
        return Err(invalid("has no steps".into()));
    }
    if !(1..=10).contains(&config.priority) {
        return Err(invalid(format!(
            "priority {} is outside 1..=10",
            config.priority
        )));
    }

    let trigger_conditions = config
        .conditions
        .iter()
        .map(|expr| TriggerCondition::from_str(expr))
        .collect::<Result<Vec<_>, _>>()?;

    let steps = config
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let secs = i64::try_from(step.delay_secs)
                .map_err(|_| invalid(format!("step {i} delay is too large")))?;
            let delay = TimeDelta::try_seconds(secs)
                .ok_or_else(|| invalid(format!("step {i} delay is too large")))?;
            Ok(SequenceStep {
                content_template: step.content.clone(),
                delay_from_previous: delay,
                channel: step.channel,
            })
        })
        .collect::<Result<Vec<_>, NurtureError>>()?;

    Ok(SequenceDefinition {
        id: config.id.clone(),
        name: config.name.clone().unwrap_or_else(|| config.id.clone()),
        sequence_type: config.sequence_type.clone(),
        trigger_type: config.trigger_type,
        trigger_conditions,
        steps,
        max_executions_per_user: config.max_executions_per_user,
        allow_concurrent: config.allow_concurrent,
        priority: config.priority,
        active: config.active,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use nurture_config::model::StepConfig;
    use nurture_core::{Channel, TriggerType};
    use serde_json::json;

    use super::*;

    fn sequence(id: &str, trigger: TriggerType, conditions: &[&str]) -> SequenceConfig {
        SequenceConfig {
            id: id.into(),
            name: None,
            sequence_type: "engagement".into(),
            trigger_type: trigger,
            conditions: conditions.iter().map(|c| c.to_string()).collect(),
            max_executions_per_user: None,
            allow_concurrent: false,
            priority: 5,
            active: true,
            steps: vec![StepConfig {
                content: "hello".into(),
                delay_secs: 3600,
                channel: Channel::Chat,
            }],
        }
    }

    fn event(trigger: TriggerType, payload: serde_json::Value) -> TriggerEvent {
        TriggerEvent {
            user_id: "u1".into(),
            trigger_type: trigger,
            payload,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn parses_steps_and_defaults_name() {
        let registry =
            SequenceRegistry::from_config(&[sequence("s1", TriggerType::NewUser, &[])]).unwrap();
        let def = registry.get("s1").unwrap();
        assert_eq!(def.name, "s1");
        assert_eq!(def.steps[0].delay_from_previous, TimeDelta::hours(1));
        assert_eq!(def.sequence_type, "engagement");
    }

    #[test]
    fn rejects_duplicates_empty_steps_and_bad_priority() {
        let dup = [
            sequence("s1", TriggerType::NewUser, &[]),
            sequence("s1", TriggerType::NewUser, &[]),
        ];
        assert!(SequenceRegistry::from_config(&dup).is_err());

        let mut empty = sequence("s2", TriggerType::NewUser, &[]);
        empty.steps.clear();
        assert!(SequenceRegistry::from_config(&[empty]).is_err());

        let mut loud = sequence("s3", TriggerType::NewUser, &[]);
        loud.priority = 11;
        assert!(SequenceRegistry::from_config(&[loud]).is_err());

        let bad = sequence("s4", TriggerType::NewUser, &["streak"]);
        assert!(matches!(
            SequenceRegistry::from_config(&[bad]),
            Err(NurtureError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn matching_filters_on_type_conditions_and_active() {
        let mut inactive = sequence("off", TriggerType::StreakMilestone, &[]);
        inactive.active = false;
        let registry = SequenceRegistry::from_config(&[
            sequence("five", TriggerType::StreakMilestone, &["streak == 5"]),
            sequence("ten", TriggerType::StreakMilestone, &["streak == 10"]),
            sequence("welcome", TriggerType::NewUser, &[]),
            inactive,
        ])
        .unwrap();

        let ids: Vec<_> = registry
            .matching(&event(TriggerType::StreakMilestone, json!({"streak": 5})))
            .iter()
            .map(|d| d.id.as_str())
            .collect();
        assert_eq!(ids, vec!["five"]);
    }

    #[test]
    fn evaluation_errors_skip_only_that_definition() {
        let registry = SequenceRegistry::from_config(&[
            sequence("ordered", TriggerType::StreakMilestone, &["streak > 3"]),
            sequence("any", TriggerType::StreakMilestone, &[]),
        ])
        .unwrap();

        let matched = registry.matching(&event(
            TriggerType::StreakMilestone,
            json!({"streak": "lots"}),
        ));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "any");
    }
}
