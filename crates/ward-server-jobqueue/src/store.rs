// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Storage trait for the durable job queue.

use async_trait::async_trait;

use ward_jobs_core::{GroupId, JobId, JobInfo, QueueType};

use crate::error::Result;

/// Storage contract for the durable job queue.
///
/// All operations are scoped to a queue type. Mutations on a claimed job
/// (heartbeat, complete) are fenced by the job's version: the store rejects
/// writes carrying a version that is no longer current with
/// [`JobQueueError::StaleClaim`](crate::JobQueueError::StaleClaim).
#[async_trait]
pub trait JobQueueStore: Send + Sync {
	/// Enqueue a batch of job definitions.
	///
	/// Definitions identical to a still-active job of the same queue type
	/// are deduplicated: the existing job is returned instead of a new one.
	/// When `group_id` is `None`, new jobs share a group minted from the id
	/// of the first job inserted in the batch.
	///
	/// With `force_one_active_group` set, the enqueue is rejected with
	/// `Conflict` if the queue type has any active jobs outside the
	/// supplied group.
	async fn enqueue(
		&self,
		queue_type: QueueType,
		definitions: &[String],
		group_id: Option<GroupId>,
		force_one_active_group: bool,
	) -> Result<Vec<JobInfo>>;

	/// Claim the next available job, if any.
	///
	/// Eligible jobs are those never claimed, plus running jobs whose last
	/// heartbeat is older than their granted timeout. Claiming increments
	/// the job's version and stamps the worker name; the caller must
	/// heartbeat within `heartbeat_timeout_secs` to keep the claim. A
	/// negative timeout is treated as zero, so the claim is immediately
	/// reclaimable.
	async fn dequeue(
		&self,
		queue_type: QueueType,
		worker: &str,
		heartbeat_timeout_secs: i64,
	) -> Result<Option<JobInfo>>;

	/// Claim up to `limit` jobs in one call. Stops early when the queue
	/// runs dry.
	async fn dequeue_jobs(
		&self,
		queue_type: QueueType,
		worker: &str,
		heartbeat_timeout_secs: i64,
		limit: u32,
	) -> Result<Vec<JobInfo>>;

	/// Refresh the claim on a running job and optionally record a progress
	/// snapshot. Returns the updated row so the worker observes
	/// `cancel_requested` without a separate read.
	async fn heartbeat(&self, job: &JobInfo, result: Option<&str>) -> Result<JobInfo>;

	/// Move a claimed job to a terminal status.
	///
	/// `job.status` carries the intent: `Failed` always lands as failed;
	/// any other status lands as cancelled when cancellation was requested,
	/// completed otherwise. `job.result`, when set, replaces the stored
	/// result; when `None` the last heartbeat snapshot is kept. With
	/// `cascade_cancel_on_failure` set, a failed outcome cancels the
	/// remaining active jobs in the same group.
	async fn complete(&self, job: &JobInfo, cascade_cancel_on_failure: bool) -> Result<JobInfo>;

	/// Request cancellation of one job. Unclaimed jobs are cancelled
	/// immediately; running jobs get the soft flag and keep running until
	/// the worker observes it. Terminal jobs are left untouched.
	async fn cancel_by_id(&self, queue_type: QueueType, id: JobId) -> Result<()>;

	/// Request cancellation of every active job in a group. Unknown groups
	/// are a no-op.
	async fn cancel_by_group(&self, queue_type: QueueType, group_id: GroupId) -> Result<()>;

	/// Fetch one job. The definition payload is omitted unless
	/// `return_definition` is set.
	async fn get_by_id(
		&self,
		queue_type: QueueType,
		id: JobId,
		return_definition: bool,
	) -> Result<JobInfo>;

	/// Fetch a batch of jobs by id, in id order. Missing ids are skipped.
	async fn get_by_ids(
		&self,
		queue_type: QueueType,
		ids: &[JobId],
		return_definition: bool,
	) -> Result<Vec<JobInfo>>;

	/// Fetch every job in a group, in id order.
	async fn get_by_group(
		&self,
		queue_type: QueueType,
		group_id: GroupId,
		return_definition: bool,
	) -> Result<Vec<JobInfo>>;
}
