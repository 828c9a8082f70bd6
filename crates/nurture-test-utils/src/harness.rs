// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test harness for engine and end-to-end tests.
//!
//! `TestHarness` assembles a migrated temp SQLite database, a configuration
//! pointing at it and a mock channel. Engine components are built by the
//! tests themselves from these pieces.

use std::path::PathBuf;
use std::sync::Arc;

use nurture_config::NurtureConfig;
use nurture_config::model::{SequenceConfig, StorageConfig};
use nurture_core::models::User;
use nurture_core::{NurtureError, StorageAdapter};
use nurture_storage::SqliteStorage;

use crate::fixtures;
use crate::mock_channel::MockChannel;

/// Builder for creating test environments with configurable options.
pub struct TestHarnessBuilder {
    sequences: Vec<SequenceConfig>,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        Self {
            sequences: Vec::new(),
        }
    }

    /// Set the `[[sequences]]` of the test configuration.
    pub fn with_sequences(mut self, sequences: Vec<SequenceConfig>) -> Self {
        self.sequences = sequences;
        self
    }

    /// Build the test harness, creating and migrating the database.
    pub async fn build(self) -> Result<TestHarness, NurtureError> {
        let temp_dir =
            tempfile::TempDir::new().map_err(|e| NurtureError::Storage { source: e.into() })?;
        let db_path = temp_dir.path().join("test.db");

        let storage_config = StorageConfig {
            database_path: db_path.to_string_lossy().to_string(),
            wal_mode: true,
        };
        let storage = SqliteStorage::new(storage_config.clone());
        storage.initialize().await?;
        let storage: Arc<dyn StorageAdapter + Send + Sync> = Arc::new(storage);

        let config = NurtureConfig {
            storage: storage_config,
            sequences: self.sequences,
            ..NurtureConfig::default()
        };

        Ok(TestHarness {
            config,
            storage,
            channel: Arc::new(MockChannel::new()),
            db_path,
            _temp_dir: temp_dir,
        })
    }
}

/// A test environment with temp storage and a mock channel.
pub struct TestHarness {
    /// Configuration whose storage section points at the temp database.
    pub config: NurtureConfig,
    /// SQLite storage adapter (temp DB, cleaned up on drop).
    pub storage: Arc<dyn StorageAdapter + Send + Sync>,
    /// The mock channel adapter.
    pub channel: Arc<MockChannel>,
    db_path: PathBuf,
    /// Temp directory kept alive for cleanup on drop.
    _temp_dir: tempfile::TempDir,
}

impl TestHarness {
    /// Create a new builder for configuring the test harness.
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Register a user with chat id `chat-<id>` and email `<id>@example.com`.
    pub async fn add_user(&self, user_id: &str) -> Result<User, NurtureError> {
        let user = User {
            user_id: user_id.to_string(),
            display_name: Some(user_id.to_string()),
            email: Some(format!("{user_id}@example.com")),
            verified_domain: None,
            channel_user_id: format!("chat-{user_id}"),
            timezone: None,
            created_at: fixtures::t0(),
        };
        self.storage.upsert_user(&user).await?;
        Ok(user)
    }
}
