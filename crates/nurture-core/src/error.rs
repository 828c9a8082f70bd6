// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Nurture engine.

use thiserror::Error;

/// The primary error type used across all Nurture crates and adapter traits.
#[derive(Debug, Error)]
pub enum NurtureError {
    /// Configuration errors (invalid TOML, bad sequence definitions, out-of-range policy).
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend errors (database connection, query failure, serialization).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Channel delivery errors (network failure, rejected request, rate limiting).
    #[error("channel error: {message}")]
    Channel {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A trigger condition could not be evaluated against an event payload.
    #[error("trigger evaluation failed for sequence {sequence_id}: {message}")]
    TriggerEvaluation { sequence_id: String, message: String },

    /// A trigger condition expression could not be parsed.
    #[error("invalid condition `{expression}`: {message}")]
    InvalidCondition { expression: String, message: String },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A state transition was requested from a state that does not allow it.
    #[error("cannot move {entity} {id} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// Another correlator currently holds the lease for this meeting.
    #[error("correlation already in progress for meeting {meeting_id}")]
    CorrelationInProgress { meeting_id: String },

    /// Requested adapter was not found or not configured.
    #[error("adapter not found: {adapter_type}/{name}")]
    AdapterNotFound { adapter_type: String, name: String },

    /// Adapter health check failed.
    #[error("health check failed for {name}: {source}")]
    HealthCheckFailed {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl NurtureError {
    /// Shorthand for a [`NurtureError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}
