// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite implementation of the durable job queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};

use ward_jobs_core::{definition_hash, GroupId, JobId, JobInfo, JobStatus, QueueType};

use crate::error::{JobQueueError, Result};
use crate::store::JobQueueStore;

const BASE_RETRY_DELAY_MS: u64 = 50;
const MAX_RETRY_DELAY_MS: u64 = 1000;
const RETRY_FACTOR: f64 = 2.0;
const MAX_RETRIES: u32 = 3;

/// SQLite-backed job queue store.
///
/// Every mutation is a single statement (or one transaction), so claims and
/// version-fenced updates stay atomic under concurrent workers.
#[derive(Clone)]
pub struct SqliteJobQueue {
	pool: SqlitePool,
}

impl SqliteJobQueue {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Create the jobs table and indexes. Safe to call repeatedly.
	#[instrument(skip(self))]
	pub async fn migrate(&self) -> Result<()> {
		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS jobqueue_jobs (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				queue_type INTEGER NOT NULL,
				group_id INTEGER NOT NULL DEFAULT 0,
				definition TEXT NOT NULL,
				definition_hash TEXT NOT NULL,
				status TEXT NOT NULL DEFAULT 'created',
				version INTEGER NOT NULL DEFAULT 1,
				cancel_requested INTEGER NOT NULL DEFAULT 0,
				result TEXT,
				worker TEXT,
				heartbeat_timeout_secs INTEGER NOT NULL DEFAULT 0,
				create_date TEXT NOT NULL,
				start_date TEXT,
				end_date TEXT,
				heartbeat_date TEXT
			)
			"#,
		)
		.execute(&self.pool)
		.await?;

		// One active copy of a definition per queue type; terminal rows drop
		// out of the index so the definition can be enqueued again.
		sqlx::query(
			r#"
			CREATE UNIQUE INDEX IF NOT EXISTS idx_jobqueue_jobs_active_hash
			ON jobqueue_jobs(queue_type, definition_hash)
			WHERE status IN ('created', 'running')
			"#,
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE INDEX IF NOT EXISTS idx_jobqueue_jobs_queue_status ON jobqueue_jobs(queue_type, status)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE INDEX IF NOT EXISTS idx_jobqueue_jobs_group ON jobqueue_jobs(queue_type, group_id)",
		)
		.execute(&self.pool)
		.await?;

		debug!("job queue schema ready");
		Ok(())
	}

	/// Retry an operation on transient SQLite errors (busy/locked) with
	/// exponential backoff.
	async fn with_retries<T, F, Fut>(&self, op: F) -> Result<T>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let mut retry_count = 0u32;
		loop {
			match op().await {
				Err(JobQueueError::Database(err)) if retry_count < MAX_RETRIES && is_transient(&err) => {
					retry_count += 1;
					let delay_ms = calculate_backoff_delay(retry_count);
					debug!(retry_count, delay_ms, error = %err, "retrying transient database error");
					tokio::time::sleep(Duration::from_millis(delay_ms)).await;
				}
				other => return other,
			}
		}
	}

	/// Distinguish a fencing failure from a missing row after a conditional
	/// update matched nothing.
	async fn stale_or_missing(&self, queue_type: QueueType, id: JobId) -> JobQueueError {
		let exists: std::result::Result<Option<(i64,)>, sqlx::Error> =
			sqlx::query_as("SELECT 1 FROM jobqueue_jobs WHERE id = ? AND queue_type = ?")
				.bind(id.0)
				.bind(queue_type.as_i64())
				.fetch_optional(&self.pool)
				.await;

		match exists {
			Ok(Some(_)) => JobQueueError::StaleClaim,
			Ok(None) => JobQueueError::NotFound,
			Err(err) => err.into(),
		}
	}

	async fn try_enqueue(
		&self,
		queue_type: QueueType,
		definitions: &[String],
		group_id: Option<GroupId>,
		force_one_active_group: bool,
	) -> Result<Vec<JobInfo>> {
		if definitions.is_empty() {
			return Ok(Vec::new());
		}

		let now = Utc::now().to_rfc3339();
		let mut tx = self.pool.begin().await?;

		if force_one_active_group {
			let (outside,): (i64,) = sqlx::query_as(
				r#"
				SELECT COUNT(*)
				FROM jobqueue_jobs
				WHERE queue_type = ? AND status IN ('created', 'running') AND group_id != ?
				"#,
			)
			.bind(queue_type.as_i64())
			.bind(group_id.map(|g| g.0).unwrap_or(-1))
			.fetch_one(&mut *tx)
			.await?;

			if outside > 0 {
				tx.rollback().await?;
				return Err(JobQueueError::Conflict);
			}
		}

		let mut batch_group = group_id;
		let mut jobs = Vec::with_capacity(definitions.len());

		for definition in definitions {
			let hash = definition_hash(definition);

			let existing: Option<JobRow> = sqlx::query_as(
				r#"
				SELECT id, queue_type, group_id, definition, status, version, cancel_requested,
					   result, worker, heartbeat_timeout_secs, create_date, start_date, end_date, heartbeat_date
				FROM jobqueue_jobs
				WHERE queue_type = ? AND definition_hash = ? AND status IN ('created', 'running')
				"#,
			)
			.bind(queue_type.as_i64())
			.bind(&hash)
			.fetch_optional(&mut *tx)
			.await?;

			if let Some(row) = existing {
				jobs.push(row.try_into()?);
				continue;
			}

			let inserted: Option<JobRow> = sqlx::query_as(
				r#"
				INSERT INTO jobqueue_jobs (queue_type, group_id, definition, definition_hash, create_date)
				VALUES (?, ?, ?, ?, ?)
				ON CONFLICT DO NOTHING
				RETURNING id, queue_type, group_id, definition, status, version, cancel_requested,
						  result, worker, heartbeat_timeout_secs, create_date, start_date, end_date, heartbeat_date
				"#,
			)
			.bind(queue_type.as_i64())
			.bind(batch_group.map(|g| g.0).unwrap_or(0))
			.bind(definition)
			.bind(&hash)
			.bind(&now)
			.fetch_optional(&mut *tx)
			.await?;

			let Some(row) = inserted else {
				// Lost a same-hash race; return the row that beat us.
				let row: JobRow = sqlx::query_as(
					r#"
					SELECT id, queue_type, group_id, definition, status, version, cancel_requested,
						   result, worker, heartbeat_timeout_secs, create_date, start_date, end_date, heartbeat_date
					FROM jobqueue_jobs
					WHERE queue_type = ? AND definition_hash = ? AND status IN ('created', 'running')
					"#,
				)
				.bind(queue_type.as_i64())
				.bind(&hash)
				.fetch_one(&mut *tx)
				.await?;
				jobs.push(row.try_into()?);
				continue;
			};

			let mut job: JobInfo = row.try_into()?;
			if batch_group.is_none() {
				// First insert mints the group shared by the rest of the batch.
				sqlx::query("UPDATE jobqueue_jobs SET group_id = id WHERE id = ?")
					.bind(job.id.0)
					.execute(&mut *tx)
					.await?;
				let minted = GroupId(job.id.0);
				batch_group = Some(minted);
				job.group_id = minted;
			}
			jobs.push(job);
		}

		tx.commit().await?;
		Ok(jobs)
	}

	async fn try_dequeue(
		&self,
		queue_type: QueueType,
		worker: &str,
		heartbeat_timeout_secs: i64,
	) -> Result<Option<JobInfo>> {
		let now = Utc::now().to_rfc3339();

		// A negative grant is stored as zero. SQLite's datetime() returns
		// NULL for a '+-N seconds' modifier, which would leave the row
		// running and unreclaimable forever.
		let heartbeat_timeout_secs = heartbeat_timeout_secs.max(0);

		// Single statement so two workers can never claim the same row.
		// Running rows become eligible again once their last heartbeat is
		// older than the timeout they were granted.
		let row: Option<JobRow> = sqlx::query_as(
			r#"
			UPDATE jobqueue_jobs
			SET status = 'running',
				version = version + 1,
				worker = ?,
				heartbeat_timeout_secs = ?,
				heartbeat_date = ?,
				start_date = COALESCE(start_date, ?)
			WHERE id = (
				SELECT id
				FROM jobqueue_jobs
				WHERE queue_type = ?
				  AND (
					status = 'created'
					OR (status = 'running'
						AND datetime(heartbeat_date, '+' || heartbeat_timeout_secs || ' seconds') <= datetime(?))
				  )
				ORDER BY id ASC
				LIMIT 1
			)
			RETURNING id, queue_type, group_id, definition, status, version, cancel_requested,
					  result, worker, heartbeat_timeout_secs, create_date, start_date, end_date, heartbeat_date
			"#,
		)
		.bind(worker)
		.bind(heartbeat_timeout_secs)
		.bind(&now)
		.bind(&now)
		.bind(queue_type.as_i64())
		.bind(&now)
		.fetch_optional(&self.pool)
		.await?;

		row.map(TryInto::try_into).transpose()
	}

	async fn try_heartbeat(&self, job: &JobInfo, result: Option<&str>) -> Result<JobInfo> {
		let now = Utc::now().to_rfc3339();

		let row: Option<JobRow> = sqlx::query_as(
			r#"
			UPDATE jobqueue_jobs
			SET heartbeat_date = ?,
				result = COALESCE(?, result)
			WHERE id = ? AND queue_type = ? AND version = ? AND status = 'running'
			RETURNING id, queue_type, group_id, definition, status, version, cancel_requested,
					  result, worker, heartbeat_timeout_secs, create_date, start_date, end_date, heartbeat_date
			"#,
		)
		.bind(&now)
		.bind(result)
		.bind(job.id.0)
		.bind(job.queue_type.as_i64())
		.bind(job.version)
		.fetch_optional(&self.pool)
		.await?;

		match row {
			Some(row) => row.try_into(),
			None => Err(self.stale_or_missing(job.queue_type, job.id).await),
		}
	}

	async fn try_complete(&self, job: &JobInfo, cascade_cancel_on_failure: bool) -> Result<JobInfo> {
		let now = Utc::now().to_rfc3339();
		let failed = job.status == JobStatus::Failed;

		let mut tx = self.pool.begin().await?;

		// A failed outcome always lands as failed; anything else lands as
		// cancelled when cancellation was requested, completed otherwise.
		let row: Option<JobRow> = sqlx::query_as(
			r#"
			UPDATE jobqueue_jobs
			SET status = CASE
					WHEN ? THEN 'failed'
					WHEN cancel_requested = 1 THEN 'cancelled'
					ELSE 'completed'
				END,
				result = COALESCE(?, result),
				end_date = ?
			WHERE id = ? AND queue_type = ? AND version = ? AND status = 'running'
			RETURNING id, queue_type, group_id, definition, status, version, cancel_requested,
					  result, worker, heartbeat_timeout_secs, create_date, start_date, end_date, heartbeat_date
			"#,
		)
		.bind(failed)
		.bind(job.result.as_deref())
		.bind(&now)
		.bind(job.id.0)
		.bind(job.queue_type.as_i64())
		.bind(job.version)
		.fetch_optional(&mut *tx)
		.await?;

		let Some(row) = row else {
			tx.rollback().await?;
			return Err(self.stale_or_missing(job.queue_type, job.id).await);
		};

		let completed: JobInfo = row.try_into()?;

		if completed.status == JobStatus::Failed && cascade_cancel_on_failure {
			sqlx::query(
				r#"
				UPDATE jobqueue_jobs
				SET status = 'cancelled', end_date = ?
				WHERE queue_type = ? AND group_id = ? AND status = 'created'
				"#,
			)
			.bind(&now)
			.bind(job.queue_type.as_i64())
			.bind(completed.group_id.0)
			.execute(&mut *tx)
			.await?;

			sqlx::query(
				r#"
				UPDATE jobqueue_jobs
				SET cancel_requested = 1
				WHERE queue_type = ? AND group_id = ? AND status = 'running'
				"#,
			)
			.bind(job.queue_type.as_i64())
			.bind(completed.group_id.0)
			.execute(&mut *tx)
			.await?;
		}

		tx.commit().await?;
		Ok(completed)
	}

	async fn try_cancel_by_id(&self, queue_type: QueueType, id: JobId) -> Result<()> {
		let now = Utc::now().to_rfc3339();
		let mut tx = self.pool.begin().await?;

		let exists: Option<(i64,)> =
			sqlx::query_as("SELECT 1 FROM jobqueue_jobs WHERE id = ? AND queue_type = ?")
				.bind(id.0)
				.bind(queue_type.as_i64())
				.fetch_optional(&mut *tx)
				.await?;

		if exists.is_none() {
			tx.rollback().await?;
			return Err(JobQueueError::NotFound);
		}

		sqlx::query(
			r#"
			UPDATE jobqueue_jobs
			SET status = 'cancelled', end_date = ?
			WHERE id = ? AND queue_type = ? AND status = 'created'
			"#,
		)
		.bind(&now)
		.bind(id.0)
		.bind(queue_type.as_i64())
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			r#"
			UPDATE jobqueue_jobs
			SET cancel_requested = 1
			WHERE id = ? AND queue_type = ? AND status = 'running'
			"#,
		)
		.bind(id.0)
		.bind(queue_type.as_i64())
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(())
	}

	async fn try_cancel_by_group(&self, queue_type: QueueType, group_id: GroupId) -> Result<()> {
		let now = Utc::now().to_rfc3339();
		let mut tx = self.pool.begin().await?;

		sqlx::query(
			r#"
			UPDATE jobqueue_jobs
			SET status = 'cancelled', end_date = ?
			WHERE queue_type = ? AND group_id = ? AND status = 'created'
			"#,
		)
		.bind(&now)
		.bind(queue_type.as_i64())
		.bind(group_id.0)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			r#"
			UPDATE jobqueue_jobs
			SET cancel_requested = 1
			WHERE queue_type = ? AND group_id = ? AND status = 'running'
			"#,
		)
		.bind(queue_type.as_i64())
		.bind(group_id.0)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		Ok(())
	}

	async fn try_get_by_id(
		&self,
		queue_type: QueueType,
		id: JobId,
		return_definition: bool,
	) -> Result<JobInfo> {
		let row: Option<JobRow> = sqlx::query_as(
			r#"
			SELECT id, queue_type, group_id,
				   CASE WHEN ? THEN definition END AS definition,
				   status, version, cancel_requested, result, worker, heartbeat_timeout_secs,
				   create_date, start_date, end_date, heartbeat_date
			FROM jobqueue_jobs
			WHERE id = ? AND queue_type = ?
			"#,
		)
		.bind(return_definition)
		.bind(id.0)
		.bind(queue_type.as_i64())
		.fetch_optional(&self.pool)
		.await?;

		match row {
			Some(row) => row.try_into(),
			None => Err(JobQueueError::NotFound),
		}
	}

	async fn try_get_by_ids(
		&self,
		queue_type: QueueType,
		ids: &[JobId],
		return_definition: bool,
	) -> Result<Vec<JobInfo>> {
		if ids.is_empty() {
			return Ok(Vec::new());
		}

		let placeholders = vec!["?"; ids.len()].join(", ");
		let sql = format!(
			r#"
			SELECT id, queue_type, group_id,
				   CASE WHEN ? THEN definition END AS definition,
				   status, version, cancel_requested, result, worker, heartbeat_timeout_secs,
				   create_date, start_date, end_date, heartbeat_date
			FROM jobqueue_jobs
			WHERE queue_type = ? AND id IN ({placeholders})
			ORDER BY id ASC
			"#
		);

		let mut query = sqlx::query_as::<_, JobRow>(&sql)
			.bind(return_definition)
			.bind(queue_type.as_i64());
		for id in ids {
			query = query.bind(id.0);
		}

		let rows = query.fetch_all(&self.pool).await?;
		rows.into_iter().map(TryInto::try_into).collect()
	}

	async fn try_get_by_group(
		&self,
		queue_type: QueueType,
		group_id: GroupId,
		return_definition: bool,
	) -> Result<Vec<JobInfo>> {
		let rows = sqlx::query_as::<_, JobRow>(
			r#"
			SELECT id, queue_type, group_id,
				   CASE WHEN ? THEN definition END AS definition,
				   status, version, cancel_requested, result, worker, heartbeat_timeout_secs,
				   create_date, start_date, end_date, heartbeat_date
			FROM jobqueue_jobs
			WHERE queue_type = ? AND group_id = ?
			ORDER BY id ASC
			"#,
		)
		.bind(return_definition)
		.bind(queue_type.as_i64())
		.bind(group_id.0)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(TryInto::try_into).collect()
	}
}

#[async_trait]
impl JobQueueStore for SqliteJobQueue {
	#[instrument(skip(self, definitions), fields(queue_type = %queue_type, definitions = definitions.len()))]
	async fn enqueue(
		&self,
		queue_type: QueueType,
		definitions: &[String],
		group_id: Option<GroupId>,
		force_one_active_group: bool,
	) -> Result<Vec<JobInfo>> {
		self.with_retries(|| self.try_enqueue(queue_type, definitions, group_id, force_one_active_group))
			.await
	}

	#[instrument(skip(self), fields(queue_type = %queue_type, worker = %worker))]
	async fn dequeue(
		&self,
		queue_type: QueueType,
		worker: &str,
		heartbeat_timeout_secs: i64,
	) -> Result<Option<JobInfo>> {
		self.with_retries(|| self.try_dequeue(queue_type, worker, heartbeat_timeout_secs))
			.await
	}

	#[instrument(skip(self), fields(queue_type = %queue_type, worker = %worker))]
	async fn dequeue_jobs(
		&self,
		queue_type: QueueType,
		worker: &str,
		heartbeat_timeout_secs: i64,
		limit: u32,
	) -> Result<Vec<JobInfo>> {
		let mut jobs = Vec::new();
		for _ in 0..limit {
			match self.dequeue(queue_type, worker, heartbeat_timeout_secs).await? {
				Some(job) => jobs.push(job),
				None => break,
			}
		}
		Ok(jobs)
	}

	#[instrument(skip(self, job, result), fields(job_id = %job.id, version = job.version))]
	async fn heartbeat(&self, job: &JobInfo, result: Option<&str>) -> Result<JobInfo> {
		self.with_retries(|| self.try_heartbeat(job, result)).await
	}

	#[instrument(skip(self, job), fields(job_id = %job.id, version = job.version, status = %job.status))]
	async fn complete(&self, job: &JobInfo, cascade_cancel_on_failure: bool) -> Result<JobInfo> {
		self.with_retries(|| self.try_complete(job, cascade_cancel_on_failure))
			.await
	}

	#[instrument(skip(self), fields(queue_type = %queue_type, job_id = %id))]
	async fn cancel_by_id(&self, queue_type: QueueType, id: JobId) -> Result<()> {
		self.with_retries(|| self.try_cancel_by_id(queue_type, id)).await
	}

	#[instrument(skip(self), fields(queue_type = %queue_type, group_id = %group_id))]
	async fn cancel_by_group(&self, queue_type: QueueType, group_id: GroupId) -> Result<()> {
		self.with_retries(|| self.try_cancel_by_group(queue_type, group_id))
			.await
	}

	#[instrument(skip(self), fields(queue_type = %queue_type, job_id = %id))]
	async fn get_by_id(
		&self,
		queue_type: QueueType,
		id: JobId,
		return_definition: bool,
	) -> Result<JobInfo> {
		self.with_retries(|| self.try_get_by_id(queue_type, id, return_definition))
			.await
	}

	#[instrument(skip(self, ids), fields(queue_type = %queue_type, ids = ids.len()))]
	async fn get_by_ids(
		&self,
		queue_type: QueueType,
		ids: &[JobId],
		return_definition: bool,
	) -> Result<Vec<JobInfo>> {
		self.with_retries(|| self.try_get_by_ids(queue_type, ids, return_definition))
			.await
	}

	#[instrument(skip(self), fields(queue_type = %queue_type, group_id = %group_id))]
	async fn get_by_group(
		&self,
		queue_type: QueueType,
		group_id: GroupId,
		return_definition: bool,
	) -> Result<Vec<JobInfo>> {
		self.with_retries(|| self.try_get_by_group(queue_type, group_id, return_definition))
			.await
	}
}

fn calculate_backoff_delay(retry_count: u32) -> u64 {
	let delay = BASE_RETRY_DELAY_MS as f64 * RETRY_FACTOR.powi(retry_count as i32 - 1);
	(delay as u64).min(MAX_RETRY_DELAY_MS)
}

/// SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_RECOVERY, SQLITE_BUSY_SNAPSHOT,
/// plus pool-level contention.
fn is_transient(err: &sqlx::Error) -> bool {
	match err {
		sqlx::Error::Database(db) => matches!(
			db.code().as_deref(),
			Some("5") | Some("6") | Some("261") | Some("517")
		),
		sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
		_ => false,
	}
}

// Database row type for sqlx

#[derive(sqlx::FromRow)]
struct JobRow {
	id: i64,
	queue_type: i64,
	group_id: i64,
	definition: Option<String>,
	status: String,
	version: i64,
	cancel_requested: bool,
	result: Option<String>,
	worker: Option<String>,
	heartbeat_timeout_secs: i64,
	create_date: String,
	start_date: Option<String>,
	end_date: Option<String>,
	heartbeat_date: Option<String>,
}

impl TryFrom<JobRow> for JobInfo {
	type Error = JobQueueError;

	fn try_from(row: JobRow) -> Result<Self> {
		Ok(JobInfo {
			id: JobId(row.id),
			queue_type: QueueType(
				u8::try_from(row.queue_type)
					.map_err(|_| JobQueueError::Internal("Invalid queue type".to_string()))?,
			),
			group_id: GroupId(row.group_id),
			definition: row.definition,
			status: row
				.status
				.parse()
				.map_err(|_| JobQueueError::Internal("Invalid status".to_string()))?,
			version: row.version,
			cancel_requested: row.cancel_requested,
			result: row.result,
			worker: row.worker,
			heartbeat_timeout_secs: row.heartbeat_timeout_secs,
			create_date: DateTime::parse_from_rfc3339(&row.create_date)
				.map_err(|_| JobQueueError::Internal("Invalid create_date".to_string()))?
				.with_timezone(&Utc),
			start_date: row
				.start_date
				.map(|s| {
					DateTime::parse_from_rfc3339(&s)
						.map_err(|_| JobQueueError::Internal("Invalid start_date".to_string()))
						.map(|dt| dt.with_timezone(&Utc))
				})
				.transpose()?,
			end_date: row
				.end_date
				.map(|s| {
					DateTime::parse_from_rfc3339(&s)
						.map_err(|_| JobQueueError::Internal("Invalid end_date".to_string()))
						.map(|dt| dt.with_timezone(&Utc))
				})
				.transpose()?,
			heartbeat_date: row
				.heartbeat_date
				.map(|s| {
					DateTime::parse_from_rfc3339(&s)
						.map_err(|_| JobQueueError::Internal("Invalid heartbeat_date".to_string()))
						.map(|dt| dt.with_timezone(&Utc))
				})
				.transpose()?,
		})
	}
}
