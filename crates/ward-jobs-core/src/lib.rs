// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Ward durable job queue.
//!
//! This crate provides the shared job model: typed identifiers, the job
//! lifecycle status machine, and the content hash used to deduplicate job
//! definitions. It is used by both the queue storage layer
//! (`ward-server-jobqueue`) and the job execution host (`ward-server-jobs`).

pub mod job;

pub use job::{definition_hash, GroupId, JobId, JobInfo, JobStatus, QueueType};
