// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Nurture integration tests.
//!
//! Provides mock adapters and test harness infrastructure for fast,
//! deterministic, CI-runnable tests without external services.
//!
//! # Components
//!
//! - [`MockChannel`] - Mock delivery channel with scriptable failures and delays
//! - [`TestHarness`] - Temp SQLite storage plus configuration and a mock channel
//! - [`fixtures`] - Fixed timestamps, sequences and meetings

pub mod fixtures;
pub mod harness;
pub mod mock_channel;

pub use harness::TestHarness;
pub use mock_channel::MockChannel;
