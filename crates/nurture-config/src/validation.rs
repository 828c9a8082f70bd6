// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.
//!
//! Checks the semantic constraints serde cannot express: positive worker
//! counts, a coherent retry policy, correlation weights summing to one and
//! well-formed sequence definitions. All errors are collected.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;

use nurture_core::TriggerCondition;

use crate::diagnostic::ConfigError;
use crate::model::{CorrelationConfig, NurtureConfig, SequenceConfig};

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Validate a deserialized configuration.
///
/// Returns every violation rather than stopping at the first.
pub fn validate_config(config: &NurtureConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.engine.name.trim().is_empty() {
        errors.push(ConfigError::validation("engine.name must not be empty"));
    }

    if config.storage.database_path.trim().is_empty() {
        errors.push(ConfigError::validation(
            "storage.database_path must not be empty",
        ));
    }

    let worker = &config.worker;
    for (key, value) in [
        ("workers", worker.workers as u64),
        ("tick_interval_secs", worker.tick_interval_secs),
        ("batch_size", worker.batch_size as u64),
        ("send_concurrency", worker.send_concurrency as u64),
        ("claim_ttl_secs", worker.claim_ttl_secs),
        ("send_timeout_secs", worker.send_timeout_secs),
        ("dispatch_batch_size", worker.dispatch_batch_size as u64),
        ("maintenance_interval_secs", worker.maintenance_interval_secs),
        ("drain_timeout_secs", worker.drain_timeout_secs),
        ("interaction_ttl_secs", worker.interaction_ttl_secs),
    ] {
        if value == 0 {
            errors.push(ConfigError::validation(format!(
                "worker.{key} must be at least 1"
            )));
        }
    }
    if worker.claim_ttl_secs <= worker.send_timeout_secs {
        errors.push(ConfigError::validation(format!(
            "worker.claim_ttl_secs ({}) must exceed worker.send_timeout_secs ({}) so a claim outlives its send",
            worker.claim_ttl_secs, worker.send_timeout_secs
        )));
    }

    if config.retry.backoff_base_secs == 0 {
        errors.push(ConfigError::validation(
            "retry.backoff_base_secs must be at least 1",
        ));
    }
    if config.retry.backoff_cap_secs < config.retry.backoff_base_secs {
        errors.push(ConfigError::validation(format!(
            "retry.backoff_cap_secs ({}) must not be below retry.backoff_base_secs ({})",
            config.retry.backoff_cap_secs, config.retry.backoff_base_secs
        )));
    }

    validate_correlation(&config.correlation, &mut errors);

    if config.retention.message_retention_days == 0 {
        errors.push(ConfigError::validation(
            "retention.message_retention_days must be at least 1",
        ));
    }
    if config.retention.metrics_retention_days == 0 {
        errors.push(ConfigError::validation(
            "retention.metrics_retention_days must be at least 1",
        ));
    }
    if config.retention.sweep_interval_secs == 0 {
        errors.push(ConfigError::validation(
            "retention.sweep_interval_secs must be at least 1",
        ));
    }

    if let Some(url) = &config.channel.webhook_url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        errors.push(ConfigError::validation(format!(
            "channel.webhook_url `{url}` must be an http or https URL"
        )));
    }
    if config.channel.request_timeout_secs == 0 {
        errors.push(ConfigError::validation(
            "channel.request_timeout_secs must be at least 1",
        ));
    }

    if config.prometheus.enabled
        && config.prometheus.listen_addr.parse::<SocketAddr>().is_err()
    {
        errors.push(ConfigError::validation(format!(
            "prometheus.listen_addr `{}` is not a socket address",
            config.prometheus.listen_addr
        )));
    }

    let mut seen_ids = HashSet::new();
    for (i, sequence) in config.sequences.iter().enumerate() {
        if !sequence.id.trim().is_empty() && !seen_ids.insert(sequence.id.as_str()) {
            errors.push(ConfigError::validation(format!(
                "duplicate sequence id `{}` in [[sequences]] array",
                sequence.id
            )));
        }
        validate_sequence(i, sequence, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_correlation(c: &CorrelationConfig, errors: &mut Vec<ConfigError>) {
    if !(c.acceptance_threshold > 0.0 && c.acceptance_threshold <= 1.0) {
        errors.push(ConfigError::validation(format!(
            "correlation.acceptance_threshold must be in (0, 1], got {}",
            c.acceptance_threshold
        )));
    }
    if !(0.0..0.5).contains(&c.tie_epsilon) {
        errors.push(ConfigError::validation(format!(
            "correlation.tie_epsilon must be in [0, 0.5), got {}",
            c.tie_epsilon
        )));
    }
    if !(c.exact_email_floor >= c.acceptance_threshold && c.exact_email_floor <= 1.0) {
        errors.push(ConfigError::validation(format!(
            "correlation.exact_email_floor must be between acceptance_threshold and 1, got {}",
            c.exact_email_floor
        )));
    }
    // Name, domain and timing scores are capped at floor - epsilon.
    if c.acceptance_threshold > c.exact_email_floor - c.tie_epsilon {
        errors.push(ConfigError::validation(format!(
            "correlation.acceptance_threshold ({}) must not exceed exact_email_floor - tie_epsilon ({}) or only exact emails can match",
            c.acceptance_threshold,
            c.exact_email_floor - c.tie_epsilon
        )));
    }

    let weights = [
        ("name_weight", c.name_weight),
        ("domain_weight", c.domain_weight),
        ("temporal_weight", c.temporal_weight),
    ];
    for (key, weight) in weights {
        if weight < 0.0 {
            errors.push(ConfigError::validation(format!(
                "correlation.{key} must be non-negative, got {weight}"
            )));
        }
    }
    let sum: f64 = weights.iter().map(|(_, w)| w).sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        errors.push(ConfigError::validation(format!(
            "correlation weights must sum to 1, got {sum}"
        )));
    }

    for (key, value) in [
        ("join_grace_secs", c.join_grace_secs),
        ("early_arrival_secs", c.early_arrival_secs),
        ("late_arrival_secs", c.late_arrival_secs),
    ] {
        if value < 0 {
            errors.push(ConfigError::validation(format!(
                "correlation.{key} must be non-negative, got {value}"
            )));
        }
    }
    if c.temporal_horizon_secs <= 0 {
        errors.push(ConfigError::validation(
            "correlation.temporal_horizon_secs must be at least 1",
        ));
    }
    if c.lease_ttl_secs <= 0 {
        errors.push(ConfigError::validation(
            "correlation.lease_ttl_secs must be at least 1",
        ));
    }
}

fn validate_sequence(i: usize, s: &SequenceConfig, errors: &mut Vec<ConfigError>) {
    let at = if s.id.trim().is_empty() {
        format!("sequences[{i}]")
    } else {
        format!("sequences[{i}] (`{}`)", s.id)
    };

    if s.id.trim().is_empty() {
        errors.push(ConfigError::validation(format!("{at}.id must not be empty")));
    }
    if s.sequence_type.trim().is_empty() {
        errors.push(ConfigError::validation(format!(
            "{at}.sequence_type must not be empty"
        )));
    }
    if s.steps.is_empty() {
        errors.push(ConfigError::validation(format!(
            "{at} must define at least one [[sequences.steps]] entry"
        )));
    }
    for (j, step) in s.steps.iter().enumerate() {
        if step.content.trim().is_empty() {
            errors.push(ConfigError::validation(format!(
                "{at}.steps[{j}].content must not be empty"
            )));
        }
    }
    if !(1..=10).contains(&s.priority) {
        errors.push(ConfigError::validation(format!(
            "{at}.priority must be between 1 and 10, got {}",
            s.priority
        )));
    }
    if s.max_executions_per_user == Some(0) {
        errors.push(ConfigError::validation(format!(
            "{at}.max_executions_per_user must be at least 1"
        )));
    }
    for condition in &s.conditions {
        if let Err(e) = TriggerCondition::from_str(condition) {
            errors.push(ConfigError::validation(format!("{at}: {e}")));
        }
    }
}
