// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use ward_jobs_core::JobInfo;

/// Execution context handed to a job body.
pub struct JobContext {
	/// The claimed job, including its definition payload.
	pub job: JobInfo,
	/// Cancelled when the queue requests cancellation or the host shuts down.
	pub cancellation_token: CancellationToken,
	/// Progress sink; snapshots ride along on heavy heartbeats.
	pub progress: JobProgress,
}

/// Shared cell holding the most recent progress snapshot a job reported.
#[derive(Clone, Default)]
pub struct JobProgress {
	latest: Arc<Mutex<Option<String>>>,
}

impl JobProgress {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a snapshot, replacing any previous one.
	pub async fn report(&self, snapshot: impl Into<String>) {
		*self.latest.lock().await = Some(snapshot.into());
	}

	pub async fn latest(&self) -> Option<String> {
		self.latest.lock().await.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_progress_starts_empty_and_keeps_latest() {
		let progress = JobProgress::new();
		assert!(progress.latest().await.is_none());

		progress.report("3/10").await;
		assert_eq!(progress.latest().await.as_deref(), Some("3/10"));

		progress.report("7/10").await;
		assert_eq!(progress.latest().await.as_deref(), Some("7/10"));
	}

	#[tokio::test]
	async fn test_progress_shared_between_clones() {
		let progress = JobProgress::new();
		let clone = progress.clone();

		clone.report("1/2").await;
		assert_eq!(progress.latest().await.as_deref(), Some("1/2"));
	}
}
