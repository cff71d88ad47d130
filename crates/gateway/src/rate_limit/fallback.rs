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

//! Process-local fallback counters
//!
//! Used only while the shared store is unreachable, to keep a rough bound on
//! read traffic. Counts are per process: a fleet of N gateways admits up to N
//! times the limit during an outage.
//!
//! Buckets live in a `moka::sync::Cache` with a TTL and a hard entry cap, so an
//! outage with many distinct callers cannot grow memory without bound. The
//! cache evicts least-recently-used buckets and always admits new ones: once
//! the cap is reached, idle callers lose their count, active callers keep
//! theirs. Size `rate_limit.fallback_max_buckets` to the number of callers
//! expected within one bucket.

use std::{
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use chrono::{DateTime, Utc};
use moka::{policy::EvictionPolicy, sync::Cache};

/// Minute-bucket hit counters keyed by `(caller, bucket)`
pub struct LocalCounters {
	cache: Cache<(String, i64), Arc<AtomicU64>>,
	bucket_secs: i64,
}

impl LocalCounters {
	/// # Arguments
	/// * `bucket_secs` - Bucket length, normally the rate window
	/// * `ttl` - How long a bucket is kept after creation
	/// * `max_buckets` - Upper bound on buckets held at once
	pub fn new(bucket_secs: u64, ttl: Duration, max_buckets: u64) -> Self {
		let cache = Cache::builder()
			.max_capacity(max_buckets)
			.eviction_policy(EvictionPolicy::lru())
			.time_to_live(ttl)
			.build();
		Self {
			cache,
			bucket_secs: i64::try_from(bucket_secs.max(1)).unwrap_or(60),
		}
	}

	/// Count a hit for `key` at `now` and return the bucket's new total.
	pub fn hit(&self, key: &str, now: DateTime<Utc>) -> u64 {
		let bucket = now.timestamp().div_euclid(self.bucket_secs);
		// `get_with` inserts at most once per key under concurrency.
		let counter = self
			.cache
			.get_with((key.to_string(), bucket), || Arc::new(AtomicU64::new(0)));
		counter.fetch_add(1, Ordering::Relaxed) + 1
	}

	/// Unix second at which the bucket containing `now` ends.
	pub fn bucket_end(&self, now: DateTime<Utc>) -> i64 {
		(now.timestamp().div_euclid(self.bucket_secs) + 1) * self.bucket_secs
	}
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;

	use super::*;

	fn counters() -> LocalCounters {
		LocalCounters::new(60, Duration::from_secs(120), 1_000)
	}

	#[test]
	fn counts_within_a_bucket() {
		let local = counters();
		let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 5).unwrap();
		assert_eq!(local.hit("client:a", now), 1);
		assert_eq!(local.hit("client:a", now + chrono::Duration::seconds(30)), 2);
		assert_eq!(local.hit("client:b", now), 1);
	}

	#[test]
	fn next_bucket_starts_at_zero() {
		let local = counters();
		let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 59).unwrap();
		assert_eq!(local.hit("client:a", now), 1);
		assert_eq!(local.hit("client:a", now + chrono::Duration::seconds(1)), 1);
	}

	#[test]
	fn bucket_end_is_next_boundary() {
		let local = counters();
		let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 5).unwrap();
		assert_eq!(local.bucket_end(now), now.timestamp() - 5 + 60);
	}

	#[test]
	fn new_caller_is_counted_when_full() {
		let local = LocalCounters::new(60, Duration::from_secs(120), 2);
		let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 5).unwrap();
		for i in 0..50 {
			for _ in 0..3 {
				local.hit(&format!("client:warm-{i}"), now);
			}
		}
		local.cache.run_pending_tasks();

		let mut last = 0;
		for _ in 0..10 {
			last = local.hit("client:new", now);
		}
		assert_eq!(last, 10);
	}
}
