// Copyright 2025 itscheems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared counter store client
//!
//! The gateway keeps no authoritative state of its own. Sliding-window rate
//! counters, daily quotas and idempotency records all live in an external
//! atomic key-value store that is shared by every gateway instance.
//!
//! # Failure model
//!
//! The store is not owned by the gateway and may be unreachable. Every
//! operation returns [`StoreError`], whose kind tells the caller whether the
//! store is *degraded* (unreachable or too slow) or whether the command itself
//! failed. Callers branch on [`StoreError::is_degraded`] to apply their
//! fail-open / fail-closed policy instead of catching errors broadly.
//!
//! # Implementations
//!
//! - [`RedisStore`]: production client over a lazily established
//!   `ConnectionManager`, each call bounded by a timeout.
//! - [`MemoryStore`]: process-local implementation for tests and single-node
//!   development. It is NOT consistent across a horizontally scaled fleet.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use crate::memory::MemoryStore;
pub use crate::redis_store::RedisStore;

/// Error kinds reported by a [`CounterStore`]
#[derive(Debug, Clone, Error)]
pub enum StoreError {
	/// Connection refused, dropped, or any other transport failure
	#[error("store unavailable: {0}")]
	Unavailable(String),
	/// The per-call time bound elapsed
	#[error("store call timed out after {0:?}")]
	Timeout(Duration),
	/// The store answered, but the command or its reply was invalid
	#[error("store backend error: {0}")]
	Backend(String),
}

impl StoreError {
	/// `true` when the store could not be reached in time.
	///
	/// Degraded errors trigger the callers' outage policy; backend errors
	/// indicate a bug or data corruption and are logged with higher severity.
	pub fn is_degraded(&self) -> bool {
		matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
	}
}

pub type StoreResult<T> = Result<T, StoreError>;

/// State of a sliding window after pruning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
	/// Number of members that survived the prune
	pub count: u64,
	/// Score (unix milliseconds) of the oldest surviving member
	pub oldest_ms: Option<i64>,
}

/// Atomic key-value operations the gateway relies on
///
/// Window keys hold a sorted set of `(score, member)` pairs, counter keys an
/// integer and plain keys an opaque string. Implementations must make each
/// method atomic on its own; no atomicity is promised across calls.
#[async_trait]
pub trait CounterStore: Send + Sync {
	/// Drop every member scored strictly below `cutoff_ms`, then report what
	/// is left.
	async fn window_snapshot(&self, key: &str, cutoff_ms: i64) -> StoreResult<WindowSnapshot>;

	/// Add `member` at `at_ms` and refresh the key expiry to `ttl`.
	async fn window_record(
		&self,
		key: &str,
		at_ms: i64,
		member: &str,
		ttl: Duration,
	) -> StoreResult<()>;

	/// Increment a counter. The first increment sets an absolute expiry at
	/// `expire_at` (unix seconds); later increments leave it untouched.
	async fn increment_until(&self, key: &str, expire_at: i64) -> StoreResult<u64>;

	async fn get(&self, key: &str) -> StoreResult<Option<String>>;

	async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

	/// Set `key` only if it does not exist yet. Returns `true` if this call
	/// created it.
	async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

	async fn remove(&self, key: &str) -> StoreResult<()>;
}
