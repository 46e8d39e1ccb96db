// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::sqlite::SqliteJobQueue;

pub async fn create_test_pool() -> SqlitePool {
	// In-memory SQLite gives each connection its own database; cap the pool
	// at one connection so every query sees the same database.
	SqlitePoolOptions::new()
		.max_connections(1)
		.connect(":memory:")
		.await
		.unwrap()
}

pub async fn create_jobqueue_test_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	SqliteJobQueue::new(pool.clone()).migrate().await.unwrap();
	pool
}
