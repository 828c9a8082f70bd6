// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus metrics adapter for the Nurture engine.
//!
//! Uses the metrics-rs facade with the Prometheus exporter. The engine
//! records through the free functions in [`recording`]; this adapter
//! installs the recorder and, optionally, a scrape endpoint.

pub mod recording;

use std::net::SocketAddr;

use async_trait::async_trait;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use nurture_core::NurtureError;
use nurture_core::traits::adapter::PluginAdapter;
use nurture_core::types::{AdapterType, HealthStatus};

pub use recording::{
    record_correlation, record_delivery, record_tick_duration, register_metrics,
    set_daily_metric,
};

/// Prometheus metrics adapter.
///
/// Installs the Prometheus recorder and exposes a handle for rendering
/// metrics in Prometheus text format.
pub struct PrometheusAdapter {
    handle: PrometheusHandle,
}

impl PrometheusAdapter {
    /// Install the Prometheus recorder globally without a scrape endpoint.
    ///
    /// Only one recorder can be installed per process. Returns an error if a
    /// recorder is already installed.
    pub fn new() -> Result<Self, NurtureError> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            NurtureError::Internal(format!("failed to install Prometheus recorder: {e}"))
        })?;

        recording::register_metrics();
        tracing::info!("prometheus metrics recorder installed");

        Ok(Self { handle })
    }

    /// Install the recorder and serve `/metrics` on `addr`.
    ///
    /// Must be called from within a Tokio runtime; the exporter runs as a
    /// spawned task for the life of the process.
    pub fn with_listener(addr: SocketAddr) -> Result<Self, NurtureError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(addr)
            .build()
            .map_err(|e| {
                NurtureError::Internal(format!("failed to build Prometheus exporter: {e}"))
            })?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| {
            NurtureError::Internal(format!("failed to install Prometheus recorder: {e}"))
        })?;
        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(error = ?e, "prometheus exporter stopped");
            }
        });

        recording::register_metrics();
        tracing::info!(%addr, "prometheus metrics endpoint listening");

        Ok(Self { handle })
    }

    /// Get a reference to the Prometheus handle for rendering.
    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }

    /// Render all collected metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[async_trait]
impl PluginAdapter for PrometheusAdapter {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(0, 1, 0)
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Observability
    }

    async fn health_check(&self) -> Result<HealthStatus, NurtureError> {
        Ok(HealthStatus::Healthy)
    }

    async fn shutdown(&self) -> Result<(), NurtureError> {
        Ok(())
    }
}
