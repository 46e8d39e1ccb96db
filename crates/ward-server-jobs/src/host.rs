// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background host that polls a queue type and executes claimed jobs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use ward_jobs_core::QueueType;
use ward_server_jobqueue::JobQueueStore;

use crate::error::JobError;
use crate::runner::{execute_with_heartbeats, execute_with_heavy_heartbeats, JobRunner};

/// Configuration for a [`JobHost`].
#[derive(Debug, Clone)]
pub struct JobHostConfig {
	pub queue_type: QueueType,
	/// Worker identity stamped on claims.
	pub worker: String,
	/// How often an idle host polls for new jobs.
	pub poll_interval: Duration,
	/// How often running jobs heartbeat.
	pub heartbeat_period: Duration,
	/// Heartbeat timeout granted on each claim.
	pub heartbeat_timeout_secs: i64,
	pub max_concurrent_jobs: usize,
	/// Upload progress snapshots with each heartbeat.
	pub heavy_heartbeats: bool,
	/// Cancel the rest of a job's group when it fails.
	pub cascade_cancel_on_failure: bool,
}

impl Default for JobHostConfig {
	fn default() -> Self {
		Self {
			queue_type: QueueType(0),
			worker: worker_name("worker"),
			poll_interval: Duration::from_secs(1),
			heartbeat_period: Duration::from_secs(10),
			heartbeat_timeout_secs: 600,
			max_concurrent_jobs: 5,
			heavy_heartbeats: false,
			cascade_cancel_on_failure: false,
		}
	}
}

/// Build a unique worker identity for claim bookkeeping.
pub fn worker_name(prefix: &str) -> String {
	let suffix = Uuid::new_v4();
	format!("{prefix}-{suffix}")
}

/// Polls one queue type and executes claimed jobs on a bounded pool.
///
/// Shutdown stops claiming immediately, signals running jobs through their
/// cancellation tokens, and waits for them to drain. Jobs interrupted this
/// way keep their claim so another host reclaims them after the heartbeat
/// timeout.
pub struct JobHost {
	store: Arc<dyn JobQueueStore>,
	runner: Arc<dyn JobRunner>,
	config: JobHostConfig,
	shutdown: CancellationToken,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobHost {
	pub fn new(store: Arc<dyn JobQueueStore>, runner: Arc<dyn JobRunner>, config: JobHostConfig) -> Self {
		Self {
			store,
			runner,
			config,
			shutdown: CancellationToken::new(),
			handle: Mutex::new(None),
		}
	}

	/// Token cancelled when shutdown begins; running jobs observe it
	/// through their execution context.
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	#[instrument(skip(self), fields(queue_type = %self.config.queue_type, worker = %self.config.worker))]
	pub async fn start(&self) {
		let mut handle = self.handle.lock().await;
		if handle.is_some() {
			warn!("Job host already started");
			return;
		}

		let store = Arc::clone(&self.store);
		let runner = Arc::clone(&self.runner);
		let config = self.config.clone();
		let shutdown = self.shutdown.clone();
		*handle = Some(tokio::spawn(run_loop(store, runner, config, shutdown)));

		info!("Job host started");
	}

	/// Stop claiming, signal running jobs, and wait for them to drain.
	#[instrument(skip(self), fields(queue_type = %self.config.queue_type))]
	pub async fn shutdown(&self) {
		self.shutdown.cancel();

		let handle = self.handle.lock().await.take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}

		info!("Job host shut down");
	}
}

async fn run_loop(
	store: Arc<dyn JobQueueStore>,
	runner: Arc<dyn JobRunner>,
	config: JobHostConfig,
	shutdown: CancellationToken,
) {
	let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
	let mut tasks = JoinSet::new();

	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			_ = sleep(config.poll_interval) => {}
		}

		while let Some(finished) = tasks.try_join_next() {
			if let Err(err) = finished {
				error!(error = %err, "Job task panicked");
			}
		}

		// Claim until the queue runs dry or the pool is full.
		loop {
			let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
				break;
			};

			match store
				.dequeue(config.queue_type, &config.worker, config.heartbeat_timeout_secs)
				.await
			{
				Ok(Some(job)) => {
					debug!(job_id = %job.id, "Claimed job");
					let store = Arc::clone(&store);
					let runner = Arc::clone(&runner);
					let shutdown = shutdown.clone();
					let config = config.clone();
					tasks.spawn(async move {
						let _permit = permit;
						let job_id = job.id;
						let outcome = if config.heavy_heartbeats {
							execute_with_heavy_heartbeats(
								store.as_ref(),
								runner.as_ref(),
								job,
								config.heartbeat_period,
								config.cascade_cancel_on_failure,
								&shutdown,
							)
							.await
						} else {
							execute_with_heartbeats(
								store.as_ref(),
								runner.as_ref(),
								job,
								config.heartbeat_period,
								config.cascade_cancel_on_failure,
								&shutdown,
							)
							.await
						};

						// Job outcomes are logged by the executor; only queue
						// errors need surfacing here.
						match outcome {
							Ok(_) | Err(JobError::Cancelled) | Err(JobError::ClaimLost) | Err(JobError::Failed(_)) => {}
							Err(err) => {
								warn!(job_id = %job_id, error = %err, "Job finished with queue error");
							}
						}
					});
				}
				Ok(None) => break,
				Err(err) => {
					warn!(error = %err, "Dequeue failed");
					break;
				}
			}
		}
	}

	// Drain in-flight jobs; they observe shutdown through the shared token.
	while let Some(finished) = tasks.join_next().await {
		if let Err(err) = finished {
			error!(error = %err, "Job task panicked");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use async_trait::async_trait;
	use ward_jobs_core::{GroupId, JobInfo, JobStatus};
	use ward_server_jobqueue::{create_pool, SqliteJobQueue};

	use crate::context::JobContext;
	use crate::error::Result;

	async fn setup_store() -> (tempfile::TempDir, SqliteJobQueue) {
		let dir = tempfile::tempdir().unwrap();
		let url = format!("sqlite:{}", dir.path().join("jobs.db").display());
		let pool = create_pool(&url).await.unwrap();
		let store = SqliteJobQueue::new(pool);
		store.migrate().await.unwrap();
		(dir, store)
	}

	fn definitions(n: usize) -> Vec<String> {
		(0..n).map(|i| format!("job-{i}")).collect()
	}

	fn test_config(max_concurrent_jobs: usize) -> JobHostConfig {
		JobHostConfig {
			queue_type: QueueType(1),
			worker: worker_name("test"),
			poll_interval: Duration::from_millis(10),
			heartbeat_period: Duration::from_millis(50),
			heartbeat_timeout_secs: 60,
			max_concurrent_jobs,
			heavy_heartbeats: false,
			cascade_cancel_on_failure: false,
		}
	}

	struct CountingJob {
		executed: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl JobRunner for CountingJob {
		async fn run(&self, _ctx: &JobContext) -> Result<Option<String>> {
			tokio::time::sleep(Duration::from_millis(20)).await;
			self.executed.fetch_add(1, Ordering::SeqCst);
			Ok(Some("done".to_string()))
		}
	}

	struct GaugeJob {
		current: Arc<AtomicUsize>,
		peak: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl JobRunner for GaugeJob {
		async fn run(&self, _ctx: &JobContext) -> Result<Option<String>> {
			let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(50)).await;
			self.current.fetch_sub(1, Ordering::SeqCst);
			Ok(None)
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

	async fn wait_for_group<F>(store: &SqliteJobQueue, group_id: GroupId, predicate: F)
	where
		F: Fn(&[JobInfo]) -> bool,
	{
		let deadline = std::time::Instant::now() + Duration::from_secs(5);
		loop {
			let group = store.get_by_group(QueueType(1), group_id, false).await.unwrap();
			if predicate(&group) {
				return;
			}
			assert!(
				std::time::Instant::now() < deadline,
				"group never reached the expected state"
			);
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	}

	#[tokio::test]
	async fn test_host_drains_queue() {
		let (_dir, store) = setup_store().await;
		let jobs = store
			.enqueue(QueueType(1), &definitions(6), None, false)
			.await
			.unwrap();
		let group_id = jobs[0].group_id;

		let executed = Arc::new(AtomicUsize::new(0));
		let host = JobHost::new(
			Arc::new(store.clone()),
			Arc::new(CountingJob {
				executed: Arc::clone(&executed),
			}),
			test_config(3),
		);
		host.start().await;

		wait_for_group(&store, group_id, |group| {
			group.iter().all(|j| j.status == JobStatus::Completed)
		})
		.await;

		host.shutdown().await;
		assert_eq!(executed.load(Ordering::SeqCst), 6);
	}

	#[tokio::test]
	async fn test_host_respects_concurrency_limit() {
		let (_dir, store) = setup_store().await;
		let jobs = store
			.enqueue(QueueType(1), &definitions(8), None, false)
			.await
			.unwrap();
		let group_id = jobs[0].group_id;

		let current = Arc::new(AtomicUsize::new(0));
		let peak = Arc::new(AtomicUsize::new(0));
		let host = JobHost::new(
			Arc::new(store.clone()),
			Arc::new(GaugeJob {
				current: Arc::clone(&current),
				peak: Arc::clone(&peak),
			}),
			test_config(2),
		);
		host.start().await;

		wait_for_group(&store, group_id, |group| {
			group.iter().all(|j| j.status == JobStatus::Completed)
		})
		.await;

		host.shutdown().await;
		assert!(peak.load(Ordering::SeqCst) <= 2);
		assert!(peak.load(Ordering::SeqCst) >= 1);
	}

	#[tokio::test]
	async fn test_host_shutdown_abandons_running_and_stops_claiming() {
		let (_dir, store) = setup_store().await;
		let jobs = store
			.enqueue(QueueType(1), &definitions(3), None, false)
			.await
			.unwrap();
		let group_id = jobs[0].group_id;

		let host = JobHost::new(
			Arc::new(store.clone()),
			Arc::new(WaitForCancelJob),
			test_config(2),
		);
		let observer = host.shutdown_token();
		host.start().await;

		// Both slots fill; the third job stays queued.
		wait_for_group(&store, group_id, |group| {
			group.iter().filter(|j| j.status == JobStatus::Running).count() == 2
		})
		.await;
		assert!(!observer.is_cancelled());

		host.shutdown().await;
		assert!(observer.is_cancelled());

		let group = store.get_by_group(QueueType(1), group_id, false).await.unwrap();
		assert_eq!(
			group.iter().filter(|j| j.status == JobStatus::Running).count(),
			2
		);
		assert_eq!(
			group.iter().filter(|j| j.status == JobStatus::Created).count(),
			1
		);
		assert!(group.iter().all(|j| !j.cancel_requested));
	}

	#[tokio::test]
	async fn test_host_start_twice_is_noop() {
		let (_dir, store) = setup_store().await;

		let executed = Arc::new(AtomicUsize::new(0));
		let host = JobHost::new(
			Arc::new(store.clone()),
			Arc::new(CountingJob {
				executed: Arc::clone(&executed),
			}),
			test_config(1),
		);
		host.start().await;
		host.start().await;
		host.shutdown().await;
	}

	#[test]
	fn test_worker_name_has_prefix_and_unique_suffix() {
		let a = worker_name("export");
		let b = worker_name("export");
		assert!(a.starts_with("export-"));
		assert_ne!(a, b);
	}

	#[test]
	fn test_config_defaults() {
		let config = JobHostConfig::default();
		assert_eq!(config.max_concurrent_jobs, 5);
		assert_eq!(config.heartbeat_timeout_secs, 600);
		assert!(!config.heavy_heartbeats);
		assert!(config.worker.starts_with("worker-"));
	}
}
