// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Nurture engine.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use nurture_core::{Channel, TriggerType};
use serde::{Deserialize, Serialize};

/// Top-level Nurture configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NurtureConfig {
    /// Process identity and logging.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Delivery worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Delivery retry and backoff policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Attendance correlation policy.
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Retention sweep settings.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Outbound channel settings.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Prometheus metrics settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Nurture sequence definitions (`[[sequences]]`).
    #[serde(default)]
    pub sequences: Vec<SequenceConfig>,
}

/// Process identity and logging.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Name used as the prefix of worker and lease holder ids.
    #[serde(default = "default_engine_name")]
    pub name: String,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_engine_name() -> String {
    "nurture".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Enable WAL (Write-Ahead Logging) mode for SQLite.
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            wal_mode: default_wal_mode(),
        }
    }
}

fn default_database_path() -> String {
    "nurture.db".to_string()
}

fn default_wal_mode() -> bool {
    true
}

/// Delivery worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Number of independent delivery workers in this process.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Seconds between ticks of each worker.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Maximum number of messages a worker claims per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Messages sent concurrently within one tick.
    #[serde(default = "default_send_concurrency")]
    pub send_concurrency: usize,

    /// Seconds after which an unfinished claim may be taken by another worker.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,

    /// Per-message send timeout in seconds.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Attendance events dispatched per maintenance pass.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,

    /// Seconds between maintenance passes (dispatch, metrics, retention).
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Seconds to wait for workers to finish their tick on shutdown.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Seconds a delivered message stays open for an unsubscribe reply.
    #[serde(default = "default_interaction_ttl_secs")]
    pub interaction_ttl_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tick_interval_secs: default_tick_interval_secs(),
            batch_size: default_batch_size(),
            send_concurrency: default_send_concurrency(),
            claim_ttl_secs: default_claim_ttl_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            dispatch_batch_size: default_dispatch_batch_size(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            interaction_ttl_secs: default_interaction_ttl_secs(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    50
}

fn default_send_concurrency() -> usize {
    4
}

fn default_claim_ttl_secs() -> u64 {
    300
}

fn default_send_timeout_secs() -> u64 {
    15
}

fn default_dispatch_batch_size() -> usize {
    100
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

fn default_drain_timeout_secs() -> u64 {
    10
}

fn default_interaction_ttl_secs() -> u64 {
    86_400
}

/// Delivery retry and backoff configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Delivery attempts before a message is failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in seconds. Doubles on each retry.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Upper bound on any retry delay, in seconds.
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_backoff_cap_secs() -> u64 {
    3600
}

/// Attendance correlation policy.
///
/// Exact email matches score at least `exact_email_floor`. Other candidates
/// score `name_weight * name + domain_weight * domain + temporal_weight * temporal`,
/// scaled by `exact_email_floor - tie_epsilon`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CorrelationConfig {
    /// Minimum score for an accepted match.
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,

    /// Top two scores closer than this are ambiguous.
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f64,

    /// Score of an exact email match with no temporal overlap.
    #[serde(default = "default_exact_email_floor")]
    pub exact_email_floor: f64,

    #[serde(default = "default_name_weight")]
    pub name_weight: f64,

    #[serde(default = "default_domain_weight")]
    pub domain_weight: f64,

    #[serde(default = "default_temporal_weight")]
    pub temporal_weight: f64,

    /// Seconds before the scheduled start that still count as in-window.
    #[serde(default = "default_join_grace_secs")]
    pub join_grace_secs: i64,

    /// Seconds outside the window over which the temporal score decays to zero.
    #[serde(default = "default_temporal_horizon_secs")]
    pub temporal_horizon_secs: i64,

    /// Joining at least this many seconds before the start is an early arrival.
    #[serde(default = "default_early_arrival_secs")]
    pub early_arrival_secs: i64,

    /// Joining at least this many seconds after the start is a late arrival.
    #[serde(default = "default_late_arrival_secs")]
    pub late_arrival_secs: i64,

    /// Lifetime of the per-meeting correlation lease, in seconds.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: default_acceptance_threshold(),
            tie_epsilon: default_tie_epsilon(),
            exact_email_floor: default_exact_email_floor(),
            name_weight: default_name_weight(),
            domain_weight: default_domain_weight(),
            temporal_weight: default_temporal_weight(),
            join_grace_secs: default_join_grace_secs(),
            temporal_horizon_secs: default_temporal_horizon_secs(),
            early_arrival_secs: default_early_arrival_secs(),
            late_arrival_secs: default_late_arrival_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_acceptance_threshold() -> f64 {
    0.8
}

fn default_tie_epsilon() -> f64 {
    0.05
}

fn default_exact_email_floor() -> f64 {
    0.9
}

fn default_name_weight() -> f64 {
    0.6
}

fn default_domain_weight() -> f64 {
    0.25
}

fn default_temporal_weight() -> f64 {
    0.15
}

fn default_join_grace_secs() -> i64 {
    900
}

fn default_temporal_horizon_secs() -> i64 {
    3600
}

fn default_early_arrival_secs() -> i64 {
    60
}

fn default_late_arrival_secs() -> i64 {
    300
}

fn default_lease_ttl_secs() -> i64 {
    120
}

/// Retention sweep configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Days a sent, failed or skipped message is kept.
    #[serde(default = "default_message_retention_days")]
    pub message_retention_days: u32,

    /// Days a daily metrics row is kept.
    #[serde(default = "default_metrics_retention_days")]
    pub metrics_retention_days: u32,

    /// Seconds between retention sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            message_retention_days: default_message_retention_days(),
            metrics_retention_days: default_metrics_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_message_retention_days() -> u32 {
    90
}

fn default_metrics_retention_days() -> u32 {
    400
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

/// Outbound channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Endpoint receiving rendered messages as JSON POST requests.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Bearer token sent with each webhook request.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    /// Install the Prometheus recorder at startup.
    #[serde(default)]
    pub enabled: bool,

    /// Address the `/metrics` scrape endpoint listens on.
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_listen_addr(),
        }
    }
}

fn default_metrics_listen_addr() -> String {
    "127.0.0.1:9464".to_string()
}

/// One `[[sequences]]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceConfig {
    /// Unique sequence id.
    pub id: String,

    /// Human-readable name. Defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    /// Preference and metrics grouping key (e.g. "onboarding").
    pub sequence_type: String,

    /// Event type that starts this sequence.
    pub trigger_type: TriggerType,

    /// Predicates over the trigger payload, e.g. `"streak == 5"`. All must hold.
    #[serde(default)]
    pub conditions: Vec<String>,

    /// Maximum number of instances one user may ever run.
    #[serde(default)]
    pub max_executions_per_user: Option<u32>,

    /// Allow several active instances per user.
    #[serde(default)]
    pub allow_concurrent: bool,

    /// Queue priority, 1 (highest) to 10 (lowest).
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Inactive sequences never match.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

fn default_priority() -> u8 {
    5
}

fn default_active() -> bool {
    true
}

/// One step of a sequence.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Message template; `{{key}}` placeholders are filled from the trigger payload.
    pub content: String,

    /// Seconds after the previous step was sent (after the trigger for step 0).
    #[serde(default)]
    pub delay_secs: u64,

    #[serde(default)]
    pub channel: Channel,
}
