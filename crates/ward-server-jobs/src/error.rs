// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use ward_server_jobqueue::JobQueueError;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
	/// The job observed a cancellation request (or host shutdown) and stopped.
	#[error("job cancelled")]
	Cancelled,

	/// The job ran and reported failure; the message becomes the stored result.
	#[error("job failed: {0}")]
	Failed(String),

	/// The claim was superseded by another worker; all writes were abandoned.
	#[error("job claim lost")]
	ClaimLost,

	#[error("queue error: {0}")]
	Queue(#[from] JobQueueError),
}
