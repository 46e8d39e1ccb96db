// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job types for the durable job queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a job.
///
/// Ids are assigned by the store in strictly increasing creation order and
/// are never reused, so they double as the FIFO dispatch order within a
/// queue type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for JobId {
	type Err = std::num::ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

/// Identifier shared by a batch of related jobs.
///
/// When no group is supplied at enqueue time, the store mints one from the
/// id of the first job inserted in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for GroupId {
	type Err = std::num::ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

/// Logical queue a job belongs to.
///
/// Each queue type is an independent FIFO lane; workers only ever claim
/// jobs from the queue type they are configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueType(pub u8);

impl QueueType {
	pub fn as_i64(self) -> i64 {
		i64::from(self.0)
	}
}

impl fmt::Display for QueueType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for QueueType {
	type Err = std::num::ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	/// Enqueued, waiting to be claimed
	Created,
	/// Claimed by a worker and executing (or abandoned, pending reclaim)
	Running,
	/// Finished successfully
	Completed,
	/// Finished with an error
	Failed,
	/// Cancelled before or during execution
	Cancelled,
}

impl JobStatus {
	/// Whether the status is final. Terminal jobs never change again and
	/// no longer participate in deduplication.
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Created => "created",
			Self::Running => "running",
			Self::Completed => "completed",
			Self::Failed => "failed",
			Self::Cancelled => "cancelled",
		}
	}
}

impl fmt::Display for JobStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl FromStr for JobStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"created" => Ok(Self::Created),
			"running" => Ok(Self::Running),
			"completed" => Ok(Self::Completed),
			"failed" => Ok(Self::Failed),
			"cancelled" => Ok(Self::Cancelled),
			_ => Err(format!("unknown job status: {s}")),
		}
	}
}

/// A job record as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
	pub id: JobId,
	pub queue_type: QueueType,
	pub group_id: GroupId,

	/// Opaque work payload. `None` when the record was fetched without
	/// the definition to keep reads cheap.
	pub definition: Option<String>,

	pub status: JobStatus,

	/// Fencing token. Incremented every time the job is claimed; a worker
	/// holding a stale version can no longer heartbeat or complete the job.
	pub version: i64,

	/// Soft cancellation flag observed by the executing worker on its
	/// next heartbeat.
	pub cancel_requested: bool,

	/// Latest progress snapshot, or the final result once terminal.
	pub result: Option<String>,

	/// Name of the worker currently (or last) holding the claim.
	pub worker: Option<String>,

	/// Seconds without a heartbeat before the claim is considered
	/// abandoned and the job becomes reclaimable.
	pub heartbeat_timeout_secs: i64,

	pub create_date: DateTime<Utc>,
	/// Set on first claim only; reclaims keep the original value.
	pub start_date: Option<DateTime<Utc>>,
	pub end_date: Option<DateTime<Utc>>,
	pub heartbeat_date: Option<DateTime<Utc>>,
}

impl JobInfo {
	/// Whether the job can still be claimed, heartbeated, or cancelled.
	pub fn is_active(&self) -> bool {
		!self.status.is_terminal()
	}
}

/// Content hash of a job definition, used to deduplicate enqueues within
/// a queue type while an identical job is still active.
pub fn definition_hash(definition: &str) -> String {
	hex::encode(Sha256::digest(definition.as_bytes()))
}
