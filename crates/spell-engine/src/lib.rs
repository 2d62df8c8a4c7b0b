// SPDX-License-Identifier: MIT OR Apache-2.0
//! spell-engine
#![deny(unsafe_code)]
//!
//! The execution engine: input validation, policy gating, the step DAG
//! scheduler with bounded parallelism and deadlines, reverse-order
//! rollback with compensation accounting, and the cast orchestrator that
//! ties it all together and writes redacted receipts.

/// Cooperative cancellation token shared by steps and the API server.
pub mod cancel;
/// Cast orchestrator and receipt writer.
pub mod cast;
/// Post-execution check evaluation.
pub mod checks;
/// Docker runner delegation.
pub mod docker;
/// Shell and http step executors.
pub mod executor;
/// Rollback planning and compensation accounting.
pub mod rollback;
/// Step DAG scheduler.
pub mod scheduler;

pub use cancel::CancelToken;
pub use cast::{CastFailure, CastOptions, CastOutcome, cast};
pub use scheduler::{SchedulerConfig, SchedulerRun, run_steps};
