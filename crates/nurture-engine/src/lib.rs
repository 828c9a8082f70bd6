// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Nurture engine.
//!
//! Turns trigger events into per-user sequence instances, delivers their
//! steps through a durable queue, and correlates meeting attendance into
//! events that start further sequences. All state lives behind the
//! [`StorageAdapter`](nurture_core::StorageAdapter); every component here can
//! run in any number of processes against the same database.

pub mod aggregator;
pub mod backoff;
pub mod correlator;
pub mod dispatch;
pub mod interaction;
pub mod matching;
pub mod preferences;
pub mod registry;
pub mod retention;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;
pub mod template;
pub mod worker;

pub use aggregator::MetricsAggregator;
pub use backoff::BackoffPolicy;
pub use correlator::{AttendanceCorrelator, CorrelationReport};
pub use dispatch::{AttendanceDispatcher, DispatchReport};
pub use interaction::{DeliveryContext, InteractionContexts};
pub use matching::{MatchDecision, MatchPolicy, UnmatchedReason};
pub use preferences::{PreferenceDecision, PreferenceGate};
pub use registry::SequenceRegistry;
pub use retention::RetentionSweeper;
pub use runtime::{MaintenanceReport, NurtureRuntime};
pub use scheduler::{SchedulerOutcome, SequenceScheduler, SkipReason};
pub use shutdown::install_signal_handler;
pub use worker::{DeliveryWorker, TickReport, WorkerSettings};
