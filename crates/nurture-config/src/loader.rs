// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./nurture.toml` > `~/.config/nurture/nurture.toml` > `/etc/nurture/nurture.toml`
//! with environment variable overrides via `NURTURE_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::NurtureConfig;

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/nurture/nurture.toml` (system-wide)
/// 3. `~/.config/nurture/nurture.toml` (user XDG config)
/// 4. `./nurture.toml` (local directory)
/// 5. `NURTURE_*` environment variables
pub fn load_config() -> Result<NurtureConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string only (no XDG lookup, no env).
///
/// Used for testing and explicit configuration.
pub fn load_config_from_str(toml_content: &str) -> Result<NurtureConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(NurtureConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<NurtureConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(NurtureConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Build the Figment used for config loading, before extraction.
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(NurtureConfig::default()))
        .merge(Toml::file("/etc/nurture/nurture.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("nurture/nurture.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("nurture.toml"))
        .merge(env_provider())
}

/// Environment variable provider with explicit section-to-dot mapping.
///
/// Uses `Env::map()` rather than `Env::split("_")` because keys contain
/// underscores: `NURTURE_WORKER_CLAIM_TTL_SECS` must map to
/// `worker.claim_ttl_secs`, not `worker.claim.ttl.secs`.
fn env_provider() -> Env {
    Env::prefixed("NURTURE_").map(|key| map_env_key(key.as_str()).into())
}

const SECTIONS: [&str; 8] = [
    "engine",
    "storage",
    "worker",
    "retry",
    "correlation",
    "retention",
    "channel",
    "prometheus",
];

fn map_env_key(key: &str) -> String {
    for section in SECTIONS {
        if let Some(rest) = key.strip_prefix(section).and_then(|r| r.strip_prefix('_')) {
            return format!("{section}.{rest}");
        }
    }
    key.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_map_to_their_section() {
        assert_eq!(map_env_key("worker_claim_ttl_secs"), "worker.claim_ttl_secs");
        assert_eq!(map_env_key("storage_database_path"), "storage.database_path");
        assert_eq!(
            map_env_key("correlation_acceptance_threshold"),
            "correlation.acceptance_threshold"
        );
        assert_eq!(map_env_key("channel_auth_token"), "channel.auth_token");
    }

    #[test]
    fn unknown_prefixes_are_left_alone() {
        assert_eq!(map_env_key("something_else"), "something_else");
        assert_eq!(map_env_key("workers"), "workers");
    }
}
