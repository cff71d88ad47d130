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

//! Per-caller request throttling
//!
//! # Sliding Window
//!
//! Each caller owns a sorted set in the shared store whose members are the
//! timestamps of its admitted requests. A check prunes members older than the
//! window, counts what is left, and records a new member only if the count is
//! below the limit. Count and record are two store calls, so concurrent
//! requests of one caller can overshoot the limit by at most the number of
//! requests in flight; the window corrects itself as members age out.
//!
//! A per-day counter, expiring at the caller's local midnight, caps total
//! volume independently of the window.
//!
//! # Store Outages
//!
//! When the store cannot be reached in time:
//!
//! - mutating requests are refused with a fixed retry hint (fail closed);
//! - safe requests are counted in [`LocalCounters`] and admitted while under
//!   the per-minute limit (fail open).

pub mod fallback;

use std::{sync::Arc, time::Duration};

use actix_web::http::StatusCode;
use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};
use tavola_store::{CounterStore, StoreResult};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub use self::fallback::LocalCounters;
use crate::{
	config::{FAIL_CLOSED_RETRY_AFTER_SECS, RATE_WINDOW_GRACE_SECS, RateLimitConfig, RateLimits},
	identity::Identity,
	request::GatewayResponse,
};

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_BURST: &str = "X-RateLimit-Burst";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

const KEY_PREFIX: &str = "ratelimit";

/// Quota state reported on every response after the check ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
	pub limit: u64,
	pub remaining: u64,
	/// Unix seconds
	pub reset_at: i64,
	pub burst: u64,
}

impl RateLimitStatus {
	pub fn apply(&self, response: &mut GatewayResponse) {
		response.set_header(HEADER_LIMIT, &self.limit.to_string());
		response.set_header(HEADER_REMAINING, &self.remaining.to_string());
		response.set_header(HEADER_RESET, &self.reset_at.to_string());
		if self.burst > 0 {
			response.set_header(HEADER_BURST, &self.burst.to_string());
		}
	}
}

#[derive(Debug, Error)]
pub enum RateLimitError {
	#[error("Rate limit exceeded. Try again in {retry_after} seconds")]
	WindowExceeded {
		status: RateLimitStatus,
		retry_after: u64,
	},
	#[error("Daily request limit of {daily_limit} exceeded")]
	DailyExceeded {
		status: RateLimitStatus,
		daily_limit: u64,
		retry_after: u64,
	},
	#[error("Rate limiting is temporarily unavailable; write requests are refused")]
	StoreUnavailable {
		status: RateLimitStatus,
		retry_after: u64,
	},
}

impl RateLimitError {
	pub fn code(&self) -> &'static str {
		match self {
			RateLimitError::DailyExceeded { .. } => "DAILY_LIMIT_EXCEEDED",
			_ => "RATE_LIMIT_EXCEEDED",
		}
	}

	pub fn http_status(&self) -> StatusCode {
		StatusCode::TOO_MANY_REQUESTS
	}

	pub fn status(&self) -> &RateLimitStatus {
		match self {
			RateLimitError::WindowExceeded { status, .. }
			| RateLimitError::DailyExceeded { status, .. }
			| RateLimitError::StoreUnavailable { status, .. } => status,
		}
	}

	pub fn retry_after(&self) -> u64 {
		match self {
			RateLimitError::WindowExceeded { retry_after, .. }
			| RateLimitError::DailyExceeded { retry_after, .. }
			| RateLimitError::StoreUnavailable { retry_after, .. } => *retry_after,
		}
	}
}

pub struct RateLimiter {
	store: Arc<dyn CounterStore>,
	config: RateLimitConfig,
	fallback: LocalCounters,
}

impl RateLimiter {
	pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
		let fallback = LocalCounters::new(
			config.window_secs,
			Duration::from_secs(config.fallback_bucket_ttl_secs),
			config.fallback_max_buckets,
		);
		Self {
			store,
			config,
			fallback,
		}
	}

	/// Custom limits, then the named plan, then the default plan.
	pub fn limits_for(&self, identity: Option<&Identity>) -> RateLimits {
		if let Some(identity) = identity {
			if let Some(custom) = identity.custom_limits {
				return custom;
			}
			if let Some(plan) = &identity.plan {
				match self.config.plan(plan) {
					Some(limits) => return limits,
					None => warn!(
						target: "gateway::rate_limit",
						plan = %plan,
						subject = %identity.subject(),
						"Unknown rate plan, using default"
					),
				}
			}
		}
		self.config.default_limits()
	}

	pub async fn check(
		&self,
		key: &str,
		identity: Option<&Identity>,
		mutating: bool,
	) -> Result<RateLimitStatus, RateLimitError> {
		self.check_at(key, identity, mutating, Utc::now()).await
	}

	/// Admit or refuse one request of `key` at `now`.
	///
	/// # Arguments
	/// * `key` - Caller key, see [`crate::identity::caller_key`]
	/// * `identity` - Source of the limits and the daily reset offset
	/// * `mutating` - Selects the outage policy
	/// * `now` - Check moment
	pub async fn check_at(
		&self,
		key: &str,
		identity: Option<&Identity>,
		mutating: bool,
		now: DateTime<Utc>,
	) -> Result<RateLimitStatus, RateLimitError> {
		let limits = self.limits_for(identity);
		let offset_minutes = identity
			.and_then(|i| i.utc_offset_minutes)
			.unwrap_or(self.config.daily_reset_utc_offset_minutes);

		match self.check_shared(key, &limits, offset_minutes, now).await {
			Ok(decision) => {
				if let Err(rejection) = &decision {
					debug!(target: "gateway::rate_limit", key = %key, code = rejection.code(), "Request throttled");
				}
				decision
			}
			Err(e) => {
				if e.is_degraded() {
					warn!(target: "gateway::rate_limit", key = %key, error = %e, mutating, "Shared store degraded, applying outage policy");
				} else {
					error!(target: "gateway::rate_limit", key = %key, error = %e, mutating, "Shared store command failed, applying outage policy");
				}
				self.check_degraded(key, &limits, mutating, now)
			}
		}
	}

	async fn check_shared(
		&self,
		key: &str,
		limits: &RateLimits,
		offset_minutes: i32,
		now: DateTime<Utc>,
	) -> StoreResult<Result<RateLimitStatus, RateLimitError>> {
		let now_ms = now.timestamp_millis();
		let window_ms = self.window_ms();
		let window_key = format!("{KEY_PREFIX}:{key}");

		let snapshot = self
			.store
			.window_snapshot(&window_key, now_ms - window_ms)
			.await?;
		let reset_at = ceil_secs(snapshot.oldest_ms.unwrap_or(now_ms) + window_ms);

		if snapshot.count >= limits.requests_per_minute {
			let retry_after = match snapshot.oldest_ms {
				Some(oldest) => ceil_secs(oldest + window_ms - now_ms),
				None => window_ms / 1000,
			};
			return Ok(Err(RateLimitError::WindowExceeded {
				status: RateLimitStatus {
					limit: limits.requests_per_minute,
					remaining: 0,
					reset_at,
					burst: limits.burst,
				},
				retry_after: positive(retry_after),
			}));
		}

		let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
		self.store
			.window_record(
				&window_key,
				now_ms,
				&member,
				Duration::from_secs(self.config.window_secs + RATE_WINDOW_GRACE_SECS),
			)
			.await?;

		let status = RateLimitStatus {
			limit: limits.requests_per_minute,
			remaining: limits
				.requests_per_minute
				.saturating_sub(snapshot.count + 1),
			reset_at,
			burst: limits.burst,
		};

		if limits.daily_limit > 0 {
			let (day, midnight) = daily_period(now, offset_minutes);
			let used = self
				.store
				.increment_until(&format!("{KEY_PREFIX}:{key}:daily:{day}"), midnight)
				.await?;
			if used > limits.daily_limit {
				return Ok(Err(RateLimitError::DailyExceeded {
					status: RateLimitStatus {
						remaining: 0,
						reset_at: midnight,
						..status
					},
					daily_limit: limits.daily_limit,
					retry_after: positive(midnight - now.timestamp()),
				}));
			}
		}

		Ok(Ok(status))
	}

	fn check_degraded(
		&self,
		key: &str,
		limits: &RateLimits,
		mutating: bool,
		now: DateTime<Utc>,
	) -> Result<RateLimitStatus, RateLimitError> {
		if mutating {
			return Err(RateLimitError::StoreUnavailable {
				status: RateLimitStatus {
					limit: limits.requests_per_minute,
					remaining: 0,
					reset_at: now.timestamp() + FAIL_CLOSED_RETRY_AFTER_SECS as i64,
					burst: limits.burst,
				},
				retry_after: FAIL_CLOSED_RETRY_AFTER_SECS,
			});
		}

		let hits = self.fallback.hit(key, now);
		let reset_at = self.fallback.bucket_end(now);
		let status = RateLimitStatus {
			limit: limits.requests_per_minute,
			remaining: limits.requests_per_minute.saturating_sub(hits),
			reset_at,
			burst: limits.burst,
		};

		if hits > limits.requests_per_minute {
			return Err(RateLimitError::WindowExceeded {
				status,
				retry_after: positive(reset_at - now.timestamp()),
			});
		}
		Ok(status)
	}

	fn window_ms(&self) -> i64 {
		i64::try_from(self.config.window_secs)
			.unwrap_or(i64::MAX / 1000)
			.saturating_mul(1000)
	}
}

/// Milliseconds to whole seconds, rounding up.
fn ceil_secs(ms: i64) -> i64 {
	ms.div_euclid(1000) + i64::from(ms.rem_euclid(1000) != 0)
}

/// Clamp a retry hint to at least one second.
fn positive(secs: i64) -> u64 {
	u64::try_from(secs).unwrap_or(0).max(1)
}

/// Local calendar day of `now` and the unix second of the next local midnight.
pub fn daily_period(now: DateTime<Utc>, offset_minutes: i32) -> (String, i64) {
	let offset = FixedOffset::east_opt(offset_minutes.saturating_mul(60)).unwrap_or(Utc.fix());
	let today = now.with_timezone(&offset).date_naive();
	let tomorrow = today.succ_opt().unwrap_or(today);
	let midnight = tomorrow.and_time(NaiveTime::MIN).and_utc().timestamp()
		- i64::from(offset.local_minus_utc());
	(today.format("%Y-%m-%d").to_string(), midnight)
}

#[cfg(test)]
mod tests {
	use std::collections::{BTreeSet, HashMap};

	use chrono::TimeZone;
	use tavola_store::MemoryStore;

	use super::*;
	use crate::identity::{AuthMethod, Role, SubjectType};

	fn config(plans: &[(&str, RateLimits)]) -> RateLimitConfig {
		RateLimitConfig {
			plans: plans
				.iter()
				.map(|(name, limits)| (name.to_string(), *limits))
				.collect::<HashMap<_, _>>(),
			..RateLimitConfig::default()
		}
	}

	fn limits(rpm: u64, daily: u64) -> RateLimits {
		RateLimits {
			requests_per_minute: rpm,
			burst: 0,
			daily_limit: daily,
		}
	}

	fn client(plan: Option<&str>, custom: Option<RateLimits>) -> Identity {
		Identity {
			subject_type: SubjectType::Client,
			client_id: Some("c-1".to_string()),
			user_id: None,
			tenant_id: Some("t-1".to_string()),
			restaurant_id: Some("r-1".to_string()),
			role: Role::Staff,
			scopes: BTreeSet::new(),
			auth_method: AuthMethod::ApiKey,
			plan: plan.map(str::to_string),
			custom_limits: custom,
			utc_offset_minutes: None,
		}
	}

	/// Noon tomorrow plus `secs`. Daily counters expire against the wall
	/// clock, so test time must not lie in the past.
	fn at(secs: i64) -> DateTime<Utc> {
		let tomorrow = Utc::now().date_naive().succ_opt().unwrap();
		tomorrow.and_hms_opt(12, 0, 0).unwrap().and_utc() + chrono::Duration::seconds(secs)
	}

	#[test]
	fn limit_precedence() {
		let limiter = RateLimiter::new(
			Arc::new(MemoryStore::new()),
			config(&[("pro", limits(600, 0))]),
		);
		assert_eq!(limiter.limits_for(None), RateLimits::FREE);
		assert_eq!(limiter.limits_for(Some(&client(None, None))), RateLimits::FREE);
		assert_eq!(
			limiter.limits_for(Some(&client(Some("pro"), None))).requests_per_minute,
			600
		);
		assert_eq!(
			limiter
				.limits_for(Some(&client(Some("pro"), Some(limits(5, 0)))))
				.requests_per_minute,
			5
		);
		assert_eq!(
			limiter.limits_for(Some(&client(Some("gold"), None))),
			RateLimits::FREE
		);
	}

	#[tokio::test]
	async fn window_denies_after_limit_and_recovers() {
		let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), RateLimitConfig::default());
		let caller = client(None, Some(limits(3, 0)));

		for (i, expected_remaining) in [2, 1, 0].into_iter().enumerate() {
			let status = limiter
				.check_at("client:c-1", Some(&caller), false, at(i as i64))
				.await
				.unwrap();
			assert_eq!(status.remaining, expected_remaining);
			assert_eq!(status.limit, 3);
		}

		let err = limiter
			.check_at("client:c-1", Some(&caller), false, at(10))
			.await
			.unwrap_err();
		assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
		// The oldest hit (t=0) leaves the window at t=60.
		assert_eq!(err.retry_after(), 50);
		assert_eq!(err.status().reset_at, at(60).timestamp());

		let status = limiter
			.check_at("client:c-1", Some(&caller), false, at(61))
			.await
			.unwrap();
		assert_eq!(status.limit, 3);
	}

	#[tokio::test]
	async fn retry_after_is_at_least_one_second() {
		let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), RateLimitConfig::default());
		let caller = client(None, Some(limits(1, 0)));
		limiter
			.check_at("k", Some(&caller), false, at(0))
			.await
			.unwrap();
		let err = limiter
			.check_at("k", Some(&caller), false, at(59) + chrono::Duration::milliseconds(999))
			.await
			.unwrap_err();
		assert_eq!(err.retry_after(), 1);
	}

	#[tokio::test]
	async fn daily_cap_is_distinct_from_window() {
		let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), RateLimitConfig::default());
		let caller = client(None, Some(limits(100, 2)));

		limiter.check_at("k", Some(&caller), true, at(0)).await.unwrap();
		limiter.check_at("k", Some(&caller), true, at(1)).await.unwrap();
		let err = limiter
			.check_at("k", Some(&caller), true, at(2))
			.await
			.unwrap_err();
		assert_eq!(err.code(), "DAILY_LIMIT_EXCEEDED");
		assert_eq!(err.status().remaining, 0);
		// Noon UTC with a zero offset: twelve hours to midnight.
		assert_eq!(err.retry_after(), 12 * 3600 - 2);
	}

	#[tokio::test]
	async fn zero_rpm_always_denies() {
		let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), RateLimitConfig::default());
		let caller = client(None, Some(limits(0, 0)));
		let err = limiter
			.check_at("k", Some(&caller), false, at(0))
			.await
			.unwrap_err();
		assert_eq!(err.retry_after(), 60);
	}

	#[test]
	fn daily_period_follows_offset() {
		let now = Utc.with_ymd_and_hms(2025, 3, 10, 23, 30, 0).unwrap();

		let (day, midnight) = daily_period(now, 0);
		assert_eq!(day, "2025-03-10");
		assert_eq!(midnight, Utc.with_ymd_and_hms(2025, 3, 11, 0, 0, 0).unwrap().timestamp());

		let (day, midnight) = daily_period(now, 60);
		assert_eq!(day, "2025-03-11");
		assert_eq!(midnight, Utc.with_ymd_and_hms(2025, 3, 11, 23, 0, 0).unwrap().timestamp());

		let (day, midnight) = daily_period(now, -300);
		assert_eq!(day, "2025-03-10");
		assert_eq!(midnight, Utc.with_ymd_and_hms(2025, 3, 11, 5, 0, 0).unwrap().timestamp());
	}

	#[test]
	fn rounding_helpers() {
		assert_eq!(ceil_secs(1), 1);
		assert_eq!(ceil_secs(1000), 1);
		assert_eq!(ceil_secs(1001), 2);
		assert_eq!(positive(-5), 1);
		assert_eq!(positive(7), 7);
	}

	#[test]
	fn headers_applied() {
		let mut response = GatewayResponse::new(StatusCode::OK);
		RateLimitStatus {
			limit: 60,
			remaining: 59,
			reset_at: 1_700_000_000,
			burst: 10,
		}
		.apply(&mut response);
		assert_eq!(response.header("x-ratelimit-limit"), Some("60"));
		assert_eq!(response.header("x-ratelimit-remaining"), Some("59"));
		assert_eq!(response.header("x-ratelimit-reset"), Some("1700000000"));
		assert_eq!(response.header("x-ratelimit-burst"), Some("10"));
	}
}
