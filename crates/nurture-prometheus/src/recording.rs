// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metric registration and recording helpers.
//!
//! Uses the metrics-rs facade so any recorder (Prometheus, statsd, etc.)
//! can collect these metrics. Without an installed recorder every call is a
//! no-op.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Register all Nurture metric descriptions.
///
/// Called once at startup after the recorder is installed.
pub fn register_metrics() {
    describe_counter!(
        "nurture_deliveries_total",
        "Delivery attempts by outcome (sent, rescheduled, failed, skipped, ...)"
    );
    describe_counter!(
        "nurture_participants_total",
        "Correlated participant records by result"
    );
    describe_counter!(
        "nurture_attendance_events_total",
        "Attendance events emitted by the correlator"
    );
    describe_gauge!(
        "nurture_daily_messages",
        "Today's queue counters per sequence type, message type and state"
    );
    describe_histogram!(
        "nurture_tick_duration_seconds",
        "Wall time of one delivery worker tick"
    );
}

/// Record the outcome of one queued message in a worker tick.
pub fn record_delivery(outcome: &'static str) {
    metrics::counter!("nurture_deliveries_total", "outcome" => outcome).increment(1);
}

/// Record a correlation run.
pub fn record_correlation(matched: u64, unmatched: u64, events: u64) {
    metrics::counter!("nurture_participants_total", "result" => "matched").increment(matched);
    metrics::counter!("nurture_participants_total", "result" => "unmatched").increment(unmatched);
    metrics::counter!("nurture_attendance_events_total").increment(events);
}

/// Publish one counter of a daily metrics row.
pub fn set_daily_metric(sequence_type: &str, message_type: &str, state: &'static str, value: u64) {
    metrics::gauge!(
        "nurture_daily_messages",
        "sequence_type" => sequence_type.to_string(),
        "message_type" => message_type.to_string(),
        "state" => state
    )
    .set(value as f64);
}

/// Record how long a worker tick took.
pub fn record_tick_duration(seconds: f64) {
    metrics::histogram!("nurture_tick_duration_seconds").record(seconds);
}
