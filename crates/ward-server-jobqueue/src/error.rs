// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for job queue operations.

use thiserror::Error;

/// Result type for job queue operations.
pub type Result<T> = std::result::Result<T, JobQueueError>;

/// Errors that can occur in job queue operations.
#[derive(Debug, Error)]
pub enum JobQueueError {
	/// Enqueue was rejected because the queue type already has active jobs
	/// outside the supplied group.
	#[error("queue type already has active jobs")]
	Conflict,

	/// The caller's claim was superseded. The job was reclaimed by another
	/// worker (or cancelled) since this version was issued; the caller must
	/// stop working on it and must not write any further state.
	#[error("job claim is stale")]
	StaleClaim,

	#[error("job not found")]
	NotFound,

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("internal error: {0}")]
	Internal(String),
}
