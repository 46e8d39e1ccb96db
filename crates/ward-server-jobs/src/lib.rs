// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job execution host for Ward server.
//!
//! Pairs with `ward-server-jobqueue`: a [`JobHost`] polls one queue type,
//! claims jobs for a [`JobRunner`], and drives each claim with heartbeats so
//! cancellation requests and superseded claims are observed mid-run.
//!
//! # Architecture
//!
//! - [`JobRunner`]: trait implemented per queue type with the actual work.
//! - [`execute_with_heartbeats`]: drives one claimed job, refreshing the
//!   claim every period and relaying cancellation into the job's token.
//! - [`JobHost`]: polling loop with a bounded worker pool and graceful
//!   shutdown; interrupted jobs keep their claim and are reclaimed by the
//!   next host once the heartbeat timeout lapses.

pub mod context;
pub mod error;
pub mod host;
pub mod runner;

pub use context::{JobContext, JobProgress};
pub use error::{JobError, Result};
pub use host::{worker_name, JobHost, JobHostConfig};
pub use runner::{execute_with_heartbeats, execute_with_heavy_heartbeats, JobRunner};
