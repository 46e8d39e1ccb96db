// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable SQLite-backed job queue for Ward server.
//!
//! This crate provides the storage layer of the job queue: FIFO dispatch per
//! queue type, content-hash deduplication of active definitions, heartbeat
//! leases with reclaim of abandoned jobs, and version-fenced writes so a
//! worker whose claim was superseded can never corrupt queue state.
//!
//! # Architecture
//!
//! - `store` - The [`JobQueueStore`] trait workers and producers program against
//! - `sqlite` - [`SqliteJobQueue`], the SQLite implementation
//! - `pool` - Connection pool construction with WAL mode
//! - `testing` - In-memory pool helpers for tests
//!
//! # Example
//!
//! ```ignore
//! use ward_server_jobqueue::{create_pool, JobQueueStore, SqliteJobQueue};
//! use ward_jobs_core::QueueType;
//!
//! let pool = create_pool("sqlite:./ward.db").await?;
//! let store = SqliteJobQueue::new(pool);
//! store.migrate().await?;
//!
//! let jobs = store
//!     .enqueue(QueueType(1), &[r#"{"step":"export"}"#.to_string()], None, false)
//!     .await?;
//!
//! if let Some(job) = store.dequeue(QueueType(1), "worker-1", 600).await? {
//!     // run the job, heartbeating as it goes
//! }
//! ```

pub mod error;
pub mod pool;
pub mod sqlite;
pub mod store;
pub mod testing;

pub use error::{JobQueueError, Result};
pub use pool::create_pool;
pub use sqlite::SqliteJobQueue;
pub use store::JobQueueStore;

// Re-export core types for convenience
pub use ward_jobs_core::*;
