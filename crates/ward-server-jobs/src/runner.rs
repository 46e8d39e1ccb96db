// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Heartbeat-driven execution of claimed jobs.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use ward_jobs_core::{JobInfo, JobStatus};
use ward_server_jobqueue::{JobQueueError, JobQueueStore};

use crate::context::{JobContext, JobProgress};
use crate::error::{JobError, Result};

/// A unit of work executed against claimed jobs.
#[async_trait]
pub trait JobRunner: Send + Sync {
	/// Execute one claimed job to completion.
	///
	/// Implementations should watch `ctx.cancellation_token` and return
	/// [`JobError::Cancelled`] promptly once it fires; returning `Cancelled`
	/// without an observed token is treated as a normal completion. The
	/// returned string becomes the job's stored result.
	async fn run(&self, ctx: &JobContext) -> Result<Option<String>>;
}

/// Drive a claimed job to completion, heartbeating every `heartbeat_period`.
///
/// The terminal status is written through [`JobQueueStore::complete`]. A job
/// interrupted by `shutdown` is left running so another worker reclaims it
/// after the heartbeat timeout; a job whose claim is superseded mid-run is
/// abandoned without writing anything.
#[instrument(skip(store, runner, job, shutdown), fields(job_id = %job.id, queue_type = %job.queue_type))]
pub async fn execute_with_heartbeats(
	store: &dyn JobQueueStore,
	runner: &dyn JobRunner,
	job: JobInfo,
	heartbeat_period: Duration,
	cascade_cancel_on_failure: bool,
	shutdown: &CancellationToken,
) -> Result<Option<String>> {
	execute_inner(
		store,
		runner,
		job,
		heartbeat_period,
		cascade_cancel_on_failure,
		shutdown,
		false,
	)
	.await
}

/// Like [`execute_with_heartbeats`], but each heartbeat also uploads the
/// job's latest progress snapshot as its intermediate result.
#[instrument(skip(store, runner, job, shutdown), fields(job_id = %job.id, queue_type = %job.queue_type))]
pub async fn execute_with_heavy_heartbeats(
	store: &dyn JobQueueStore,
	runner: &dyn JobRunner,
	job: JobInfo,
	heartbeat_period: Duration,
	cascade_cancel_on_failure: bool,
	shutdown: &CancellationToken,
) -> Result<Option<String>> {
	execute_inner(
		store,
		runner,
		job,
		heartbeat_period,
		cascade_cancel_on_failure,
		shutdown,
		true,
	)
	.await
}

enum WorkExit {
	Finished(Result<Option<String>>),
	ClaimLost,
}

async fn execute_inner(
	store: &dyn JobQueueStore,
	runner: &dyn JobRunner,
	job: JobInfo,
	heartbeat_period: Duration,
	cascade_cancel_on_failure: bool,
	shutdown: &CancellationToken,
	heavy: bool,
) -> Result<Option<String>> {
	let exec_token = shutdown.child_token();
	let progress = JobProgress::new();

	// Cancellation requested between claims is visible on the claimed row.
	let mut cancel_observed = job.cancel_requested;
	if cancel_observed {
		exec_token.cancel();
	}

	let ctx = JobContext {
		job: job.clone(),
		cancellation_token: exec_token.clone(),
		progress: progress.clone(),
	};

	let mut work = runner.run(&ctx);
	let mut current = job;

	let exit = loop {
		tokio::select! {
			outcome = &mut work => break WorkExit::Finished(outcome),
			_ = sleep(heartbeat_period) => {
				let snapshot = if heavy { progress.latest().await } else { None };
				match store.heartbeat(&current, snapshot.as_deref()).await {
					Ok(updated) => {
						if updated.cancel_requested && !cancel_observed {
							info!(job_id = %updated.id, "Cancellation requested, signalling job");
							cancel_observed = true;
							exec_token.cancel();
						}
						current = updated;
					}
					Err(JobQueueError::StaleClaim) | Err(JobQueueError::NotFound) => {
						break WorkExit::ClaimLost;
					}
					Err(err) => {
						warn!(job_id = %current.id, error = %err, "Heartbeat failed, retrying next period");
					}
				}
			}
		}
	};

	match exit {
		WorkExit::ClaimLost => {
			// Another worker owns the job now; stop the body and write nothing.
			exec_token.cancel();
			let _ = work.await;
			warn!(job_id = %current.id, "Job claim superseded, abandoning execution");
			Err(JobError::ClaimLost)
		}
		WorkExit::Finished(outcome) => {
			finish_job(store, current, outcome, cascade_cancel_on_failure, shutdown, cancel_observed).await
		}
	}
}

async fn finish_job(
	store: &dyn JobQueueStore,
	mut job: JobInfo,
	outcome: Result<Option<String>>,
	cascade_cancel_on_failure: bool,
	shutdown: &CancellationToken,
	cancel_observed: bool,
) -> Result<Option<String>> {
	match outcome {
		Ok(result) => {
			job.status = JobStatus::Completed;
			job.result = result.clone();
			complete_job(store, &job, cascade_cancel_on_failure).await?;
			info!(job_id = %job.id, "Job completed");
			Ok(result)
		}
		Err(JobError::Cancelled) => {
			if shutdown.is_cancelled() && !cancel_observed {
				// Interrupted by shutdown, not by a queue cancel request.
				// Leave the claim in place so another worker reclaims the
				// job after the heartbeat timeout.
				info!(job_id = %job.id, "Job interrupted by shutdown, leaving claim for reclaim");
				return Err(JobError::Cancelled);
			}

			// The store lands this as cancelled when the row carries the
			// cancel flag, completed otherwise.
			job.status = JobStatus::Completed;
			job.result = None;
			complete_job(store, &job, cascade_cancel_on_failure).await?;
			info!(job_id = %job.id, "Job cancelled");
			Err(JobError::Cancelled)
		}
		Err(JobError::Failed(message)) => {
			job.status = JobStatus::Failed;
			job.result = Some(message.clone());
			complete_job(store, &job, cascade_cancel_on_failure).await?;
			warn!(job_id = %job.id, error = %message, "Job failed");
			Err(JobError::Failed(message))
		}
		Err(err) => {
			job.status = JobStatus::Failed;
			job.result = Some(err.to_string());
			complete_job(store, &job, cascade_cancel_on_failure).await?;
			warn!(job_id = %job.id, error = %err, "Job failed");
			Err(err)
		}
	}
}

async fn complete_job(
	store: &dyn JobQueueStore,
	job: &JobInfo,
	cascade_cancel_on_failure: bool,
) -> Result<()> {
	match store.complete(job, cascade_cancel_on_failure).await {
		Ok(_) => Ok(()),
		Err(JobQueueError::StaleClaim) | Err(JobQueueError::NotFound) => {
			warn!(job_id = %job.id, "Completion rejected, claim superseded");
			Err(JobError::ClaimLost)
		}
		Err(err) => Err(err.into()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use tokio::sync::Notify;
	use ward_jobs_core::QueueType;
	use ward_server_jobqueue::{create_pool, SqliteJobQueue};

	async fn setup_store() -> (tempfile::TempDir, SqliteJobQueue) {
		let dir = tempfile::tempdir().unwrap();
		let url = format!("sqlite:{}", dir.path().join("jobs.db").display());
		let pool = create_pool(&url).await.unwrap();
		let store = SqliteJobQueue::new(pool);
		store.migrate().await.unwrap();
		(dir, store)
	}

	async fn claim_one(store: &SqliteJobQueue, definition: &str, timeout_secs: i64) -> JobInfo {
		store
			.enqueue(QueueType(1), &[definition.to_string()], None, false)
			.await
			.unwrap();
		store
			.dequeue(QueueType(1), "w1", timeout_secs)
			.await
			.unwrap()
			.unwrap()
	}

	struct SucceedingJob;

	#[async_trait]
	impl JobRunner for SucceedingJob {
		async fn run(&self, _ctx: &JobContext) -> Result<Option<String>> {
			Ok(Some("done".to_string()))
		}
	}

	struct FailingJob;

	#[async_trait]
	impl JobRunner for FailingJob {
		async fn run(&self, _ctx: &JobContext) -> Result<Option<String>> {
			Err(JobError::Failed("export step exploded".to_string()))
		}
	}

	struct WaitForCancelJob;

	#[async_trait]
	impl JobRunner for WaitForCancelJob {
		async fn run(&self, ctx: &JobContext) -> Result<Option<String>> {
			ctx.cancellation_token.cancelled().await;
			Err(JobError::Cancelled)
		}
	}

	struct FinishOnCancelJob;

	#[async_trait]
	impl JobRunner for FinishOnCancelJob {
		async fn run(&self, ctx: &JobContext) -> Result<Option<String>> {
			ctx.cancellation_token.cancelled().await;
			Ok(Some("partial".to_string()))
		}
	}

	struct ProgressJob {
		release: Arc<Notify>,
	}

	#[async_trait]
	impl JobRunner for ProgressJob {
		async fn run(&self, ctx: &JobContext) -> Result<Option<String>> {
			ctx.progress.report("5/10").await;
			self.release.notified().await;
			Ok(Some("10/10".to_string()))
		}
	}

	#[tokio::test]
	async fn test_execute_completes_job() {
		let (_dir, store) = setup_store().await;
		let job = claim_one(&store, "job-a", 600).await;
		let id = job.id;
		let shutdown = CancellationToken::new();

		let result = execute_with_heartbeats(
			&store,
			&SucceedingJob,
			job,
			Duration::from_millis(20),
			false,
			&shutdown,
		)
		.await
		.unwrap();
		assert_eq!(result.as_deref(), Some("done"));

		let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
		assert_eq!(stored.status, JobStatus::Completed);
		assert_eq!(stored.result.as_deref(), Some("done"));
		assert!(stored.end_date.is_some());
	}

	#[tokio::test]
	async fn test_execute_records_failure() {
		let (_dir, store) = setup_store().await;
		let job = claim_one(&store, "job-a", 600).await;
		let id = job.id;
		let shutdown = CancellationToken::new();

		let result = execute_with_heartbeats(
			&store,
			&FailingJob,
			job,
			Duration::from_millis(20),
			false,
			&shutdown,
		)
		.await;
		assert!(matches!(result, Err(JobError::Failed(_))));

		let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
		assert_eq!(stored.status, JobStatus::Failed);
		assert_eq!(stored.result.as_deref(), Some("export step exploded"));
	}

	#[tokio::test]
	async fn test_execute_observes_cancellation_via_heartbeat() {
		let (_dir, store) = setup_store().await;
		let job = claim_one(&store, "job-a", 600).await;
		let id = job.id;
		let shutdown = CancellationToken::new();

		let exec = {
			let store = store.clone();
			let shutdown = shutdown.clone();
			tokio::spawn(async move {
				execute_with_heartbeats(
					&store,
					&WaitForCancelJob,
					job,
					Duration::from_millis(10),
					false,
					&shutdown,
				)
				.await
			})
		};

		// Let the heartbeat loop start before requesting cancellation.
		tokio::time::sleep(Duration::from_millis(30)).await;
		store.cancel_by_id(QueueType(1), id).await.unwrap();

		let result = exec.await.unwrap();
		assert!(matches!(result, Err(JobError::Cancelled)));

		let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
		assert_eq!(stored.status, JobStatus::Cancelled);
		assert!(stored.end_date.is_some());
	}

	#[tokio::test]
	async fn test_execute_precancelled_job_lands_cancelled() {
		let (_dir, store) = setup_store().await;

		let first = claim_one(&store, "job-a", 0).await;
		store.cancel_by_id(QueueType(1), first.id).await.unwrap();

		// The expired claim is still reclaimable; the flag rides along.
		let job = store.dequeue(QueueType(1), "w2", 600).await.unwrap().unwrap();
		assert!(job.cancel_requested);
		let id = job.id;
		let shutdown = CancellationToken::new();

		let result = execute_with_heartbeats(
			&store,
			&WaitForCancelJob,
			job,
			Duration::from_millis(10),
			false,
			&shutdown,
		)
		.await;
		assert!(matches!(result, Err(JobError::Cancelled)));

		let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
		assert_eq!(stored.status, JobStatus::Cancelled);
	}

	#[tokio::test]
	async fn test_execute_cancelled_job_lands_cancelled_even_on_ok() {
		let (_dir, store) = setup_store().await;
		let job = claim_one(&store, "job-a", 600).await;
		let id = job.id;
		let shutdown = CancellationToken::new();

		let exec = {
			let store = store.clone();
			let shutdown = shutdown.clone();
			tokio::spawn(async move {
				execute_with_heartbeats(
					&store,
					&FinishOnCancelJob,
					job,
					Duration::from_millis(10),
					false,
					&shutdown,
				)
				.await
			})
		};

		tokio::time::sleep(Duration::from_millis(30)).await;
		store.cancel_by_id(QueueType(1), id).await.unwrap();

		let result = exec.await.unwrap().unwrap();
		assert_eq!(result.as_deref(), Some("partial"));

		let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
		assert_eq!(stored.status, JobStatus::Cancelled);
		assert_eq!(stored.result.as_deref(), Some("partial"));
	}

	#[tokio::test]
	async fn test_execute_stale_claim_abandons_without_writes() {
		let (_dir, store) = setup_store().await;

		let stale = claim_one(&store, "job-a", 0).await;
		let fresh = store.dequeue(QueueType(1), "w2", 3600).await.unwrap().unwrap();
		let shutdown = CancellationToken::new();

		let result = execute_with_heartbeats(
			&store,
			&WaitForCancelJob,
			stale,
			Duration::from_millis(10),
			false,
			&shutdown,
		)
		.await;
		assert!(matches!(result, Err(JobError::ClaimLost)));

		// The fresh claim is untouched.
		let stored = store.get_by_id(QueueType(1), fresh.id, false).await.unwrap();
		assert_eq!(stored.status, JobStatus::Running);
		assert_eq!(stored.version, fresh.version);
	}

	#[tokio::test]
	async fn test_execute_shutdown_leaves_claim_for_reclaim() {
		let (_dir, store) = setup_store().await;
		let job = claim_one(&store, "job-a", 600).await;
		let id = job.id;
		let shutdown = CancellationToken::new();

		let exec = {
			let store = store.clone();
			let shutdown = shutdown.clone();
			tokio::spawn(async move {
				execute_with_heartbeats(
					&store,
					&WaitForCancelJob,
					job,
					Duration::from_millis(10),
					false,
					&shutdown,
				)
				.await
			})
		};

		tokio::time::sleep(Duration::from_millis(30)).await;
		shutdown.cancel();

		let result = exec.await.unwrap();
		assert!(matches!(result, Err(JobError::Cancelled)));

		// No terminal status was written; the claim expires on its own.
		let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
		assert_eq!(stored.status, JobStatus::Running);
		assert!(!stored.cancel_requested);
		assert!(stored.end_date.is_none());
	}

	#[tokio::test]
	async fn test_execute_heavy_heartbeats_upload_progress() {
		let (_dir, store) = setup_store().await;
		let job = claim_one(&store, "job-a", 600).await;
		let id = job.id;
		let release = Arc::new(Notify::new());
		let runner = ProgressJob {
			release: Arc::clone(&release),
		};
		let shutdown = CancellationToken::new();

		let exec = {
			let store = store.clone();
			let shutdown = shutdown.clone();
			tokio::spawn(async move {
				execute_with_heavy_heartbeats(
					&store,
					&runner,
					job,
					Duration::from_millis(10),
					false,
					&shutdown,
				)
				.await
			})
		};

		// Wait until a heartbeat has uploaded the snapshot.
		let deadline = std::time::Instant::now() + Duration::from_secs(5);
		loop {
			let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
			if stored.result.as_deref() == Some("5/10") {
				break;
			}
			assert!(
				std::time::Instant::now() < deadline,
				"progress was never uploaded"
			);
			tokio::time::sleep(Duration::from_millis(10)).await;
		}

		release.notify_one();
		let result = exec.await.unwrap().unwrap();
		assert_eq!(result.as_deref(), Some("10/10"));

		let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
		assert_eq!(stored.status, JobStatus::Completed);
		assert_eq!(stored.result.as_deref(), Some("10/10"));
	}

	#[tokio::test]
	async fn test_execute_light_heartbeats_skip_progress() {
		let (_dir, store) = setup_store().await;
		let job = claim_one(&store, "job-a", 600).await;
		let id = job.id;
		let release = Arc::new(Notify::new());
		let runner = ProgressJob {
			release: Arc::clone(&release),
		};
		let shutdown = CancellationToken::new();

		let exec = {
			let store = store.clone();
			let shutdown = shutdown.clone();
			tokio::spawn(async move {
				execute_with_heartbeats(
					&store,
					&runner,
					job,
					Duration::from_millis(10),
					false,
					&shutdown,
				)
				.await
			})
		};

		// Several heartbeat periods pass without the snapshot leaking out.
		tokio::time::sleep(Duration::from_millis(50)).await;
		let stored = store.get_by_id(QueueType(1), id, false).await.unwrap();
		assert!(stored.result.is_none());

		release.notify_one();
		let result = exec.await.unwrap().unwrap();
		assert_eq!(result.as_deref(), Some("10/10"));
	}

	#[tokio::test]
	async fn test_execute_failure_cascades_to_group() {
		let (_dir, store) = setup_store().await;

		let definitions: Vec<String> = (0..3).map(|i| format!("job-{i}")).collect();
		let jobs = store
			.enqueue(QueueType(1), &definitions, None, false)
			.await
			.unwrap();
		let group_id = jobs[0].group_id;

		let job = store.dequeue(QueueType(1), "w1", 600).await.unwrap().unwrap();
		let shutdown = CancellationToken::new();

		let result = execute_with_heartbeats(
			&store,
			&FailingJob,
			job,
			Duration::from_millis(20),
			true,
			&shutdown,
		)
		.await;
		assert!(matches!(result, Err(JobError::Failed(_))));

		// The unclaimed siblings were cancelled outright.
		let group = store.get_by_group(QueueType(1), group_id, false).await.unwrap();
		assert_eq!(
			group.iter().filter(|j| j.status == JobStatus::Failed).count(),
			1
		);
		assert_eq!(
			group
				.iter()
				.filter(|j| j.status == JobStatus::Cancelled)
				.count(),
			2
		);
	}
}
