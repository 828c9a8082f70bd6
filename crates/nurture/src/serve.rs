// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `nurture serve` command implementation.
//!
//! Opens SQLite storage, builds the webhook channel, optionally exposes the
//! Prometheus endpoint, and runs the engine until SIGINT/SIGTERM.

use std::sync::Arc;

use nurture_config::NurtureConfig;
use nurture_core::{ChannelAdapter, NurtureError, PluginAdapter, StorageAdapter};
use nurture_engine::{NurtureRuntime, install_signal_handler};
use nurture_storage::SqliteStorage;
use nurture_webhook::WebhookChannel;
use tracing::{error, info, warn};

/// Runs the `nurture serve` command.
pub async fn run_serve(config: NurtureConfig) -> Result<(), NurtureError> {
    info!(name = config.engine.name.as_str(), "starting nurture serve");

    let storage = SqliteStorage::new(config.storage.clone());
    storage.initialize().await?;
    let storage: Arc<dyn StorageAdapter + Send + Sync> = Arc::new(storage);

    let channel = WebhookChannel::new(&config.channel).inspect_err(|e| {
        error!(error = %e, "failed to initialize webhook channel");
        eprintln!("error: set channel.webhook_url (or NURTURE_CHANNEL_WEBHOOK_URL) to serve");
    })?;
    info!(url = channel.url(), "webhook channel ready");
    let channel: Arc<dyn ChannelAdapter + Send + Sync> = Arc::new(channel);

    // Initialize Prometheus metrics (if enabled and compiled in).
    #[cfg(feature = "prometheus")]
    let _prometheus_adapter = if config.prometheus.enabled {
        match start_prometheus(&config) {
            Ok(adapter) => Some(adapter),
            Err(e) => {
                warn!(error = %e, "prometheus initialization failed, continuing without metrics");
                None
            }
        }
    } else {
        None
    };

    #[cfg(not(feature = "prometheus"))]
    if config.prometheus.enabled {
        warn!("prometheus.enabled is set but the binary was built without the prometheus feature");
    }

    let runtime = NurtureRuntime::new(config, storage.clone(), channel.clone())?;
    let cancel = install_signal_handler();
    let result = runtime.run(cancel).await;

    if let Err(e) = channel.shutdown().await {
        warn!(error = %e, "channel shutdown failed");
    }
    storage.close().await?;
    info!("nurture serve stopped");
    result
}

#[cfg(feature = "prometheus")]
fn start_prometheus(
    config: &NurtureConfig,
) -> Result<nurture_prometheus::PrometheusAdapter, NurtureError> {
    let addr = config.prometheus.listen_addr.parse().map_err(|e| {
        NurtureError::Config(format!(
            "invalid prometheus.listen_addr `{}`: {e}",
            config.prometheus.listen_addr
        ))
    })?;
    nurture_prometheus::PrometheusAdapter::with_listener(addr)
}
