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

//! Process-local [`CounterStore`]
//!
//! Each key family lives in its own `DashMap`; expiry is evaluated lazily on
//! access against the wall clock. Every method touches a single shard entry,
//! which gives the same per-call atomicity the Redis implementation offers.
//!
//! This store is per process. Two gateway instances backed by separate
//! `MemoryStore`s do not share windows, quotas or idempotency records.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{CounterStore, StoreResult, WindowSnapshot};

struct Expiring<T> {
	value: T,
	/// Unix milliseconds; `None` means no expiry
	expires_at_ms: Option<i64>,
}

impl<T> Expiring<T> {
	fn new(value: T, expires_at_ms: Option<i64>) -> Self {
		Self {
			value,
			expires_at_ms,
		}
	}

	fn is_expired(&self, now_ms: i64) -> bool {
		self.expires_at_ms.is_some_and(|at| now_ms >= at)
	}
}

/// In-memory counter store backed by `DashMap`
#[derive(Default)]
pub struct MemoryStore {
	windows: DashMap<String, Expiring<Vec<(i64, String)>>>,
	counters: DashMap<String, Expiring<u64>>,
	values: DashMap<String, Expiring<String>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

fn now_ms() -> i64 {
	Utc::now().timestamp_millis()
}

fn deadline(now_ms: i64, ttl: Duration) -> i64 {
	now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl CounterStore for MemoryStore {
	async fn window_snapshot(&self, key: &str, cutoff_ms: i64) -> StoreResult<WindowSnapshot> {
		let now = now_ms();
		self.windows.remove_if(key, |_, window| window.is_expired(now));

		let Some(mut window) = self.windows.get_mut(key) else {
			return Ok(WindowSnapshot::default());
		};
		window.value.retain(|(score, _)| *score >= cutoff_ms);

		Ok(WindowSnapshot {
			count: window.value.len() as u64,
			oldest_ms: window.value.first().map(|(score, _)| *score),
		})
	}

	async fn window_record(
		&self,
		key: &str,
		at_ms: i64,
		member: &str,
		ttl: Duration,
	) -> StoreResult<()> {
		let now = now_ms();
		let mut window = self
			.windows
			.entry(key.to_string())
			.or_insert_with(|| Expiring::new(Vec::new(), None));
		if window.is_expired(now) {
			window.value.clear();
		}

		// Sorted-set semantics: a member appears once, ordered by score.
		window.value.retain(|(_, existing)| existing != member);
		let position = window.value.partition_point(|(score, _)| *score <= at_ms);
		window.value.insert(position, (at_ms, member.to_string()));
		window.expires_at_ms = Some(deadline(now, ttl));

		Ok(())
	}

	async fn increment_until(&self, key: &str, expire_at: i64) -> StoreResult<u64> {
		let now = now_ms();
		let mut counter = self
			.counters
			.entry(key.to_string())
			.or_insert_with(|| Expiring::new(0, None));
		if counter.is_expired(now) {
			counter.value = 0;
			counter.expires_at_ms = None;
		}

		counter.value += 1;
		if counter.value == 1 {
			counter.expires_at_ms = Some(expire_at.saturating_mul(1000));
		}

		Ok(counter.value)
	}

	async fn get(&self, key: &str) -> StoreResult<Option<String>> {
		let now = now_ms();
		self.values.remove_if(key, |_, value| value.is_expired(now));
		Ok(self.values.get(key).map(|value| value.value.clone()))
	}

	async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
		let expires_at = deadline(now_ms(), ttl);
		self.values.insert(
			key.to_string(),
			Expiring::new(value.to_string(), Some(expires_at)),
		);
		Ok(())
	}

	async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
		let now = now_ms();
		let fresh = Expiring::new(value.to_string(), Some(deadline(now, ttl)));

		match self.values.entry(key.to_string()) {
			Entry::Occupied(mut occupied) => {
				if occupied.get().is_expired(now) {
					occupied.insert(fresh);
					Ok(true)
				} else {
					Ok(false)
				}
			}
			Entry::Vacant(vacant) => {
				vacant.insert(fresh);
				Ok(true)
			}
		}
	}

	async fn remove(&self, key: &str) -> StoreResult<()> {
		self.values.remove(key);
		self.counters.remove(key);
		self.windows.remove(key);
		Ok(())
	}
}
