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

//! Redis-backed [`CounterStore`]
//!
//! The connection is established on first use and shared through a
//! `ConnectionManager`, which reconnects on its own after a drop. If the first
//! connection attempt fails the next call tries again, so the gateway can start
//! while Redis is still down.

use std::{future::Future, time::Duration};

use ::redis::{
	Client, ErrorKind, RedisError, RedisResult, Script, aio::ConnectionManager, cmd, pipe,
};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{CounterStore, StoreError, StoreResult, WindowSnapshot};

/// INCR, and set the absolute expiry only when the key was just created.
const INCREMENT_UNTIL: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIREAT', KEYS[1], ARGV[1])
end
return count
";

pub struct RedisStore {
	client: Client,
	conn: OnceCell<ConnectionManager>,
	timeout: Duration,
	increment_until: Script,
}

impl RedisStore {
	/// Prepare a client for `url`. No connection is opened here.
	///
	/// # Arguments
	/// * `url` - Redis connection URL, e.g. `redis://127.0.0.1:6379/0`
	/// * `timeout` - Upper bound for every store call, connection included
	pub fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
		let client = Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
		Ok(Self {
			client,
			conn: OnceCell::new(),
			timeout,
			increment_until: Script::new(INCREMENT_UNTIL),
		})
	}

	async fn connection(&self) -> StoreResult<ConnectionManager> {
		let conn = self
			.conn
			.get_or_try_init(|| async {
				debug!(target: "store::redis", "opening redis connection manager");
				self.client.get_connection_manager().await
			})
			.await
			.map_err(classify)?;
		Ok(conn.clone())
	}

	/// Run `op` on a shared connection, bounded by the configured timeout.
	async fn run<T, F, Fut>(&self, op: F) -> StoreResult<T>
	where
		F: FnOnce(ConnectionManager) -> Fut,
		Fut: Future<Output = RedisResult<T>>,
	{
		let call = async {
			let conn = self.connection().await?;
			op(conn).await.map_err(classify)
		};

		match tokio::time::timeout(self.timeout, call).await {
			Ok(result) => {
				if let Err(e) = &result {
					warn!(target: "store::redis", error = %e, "redis call failed");
				}
				result
			}
			Err(_) => {
				warn!(target: "store::redis", timeout = ?self.timeout, "redis call timed out");
				Err(StoreError::Timeout(self.timeout))
			}
		}
	}
}

fn classify(err: RedisError) -> StoreError {
	if err.is_timeout() {
		return StoreError::Unavailable(format!("timed out: {err}"));
	}
	if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
		return StoreError::Unavailable(err.to_string());
	}
	match err.kind() {
		ErrorKind::ClusterDown | ErrorKind::MasterDown | ErrorKind::BusyLoadingError => {
			StoreError::Unavailable(err.to_string())
		}
		_ => StoreError::Backend(err.to_string()),
	}
}

fn millis(ttl: Duration) -> u64 {
	u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
	async fn window_snapshot(&self, key: &str, cutoff_ms: i64) -> StoreResult<WindowSnapshot> {
		let (count, oldest): (u64, Vec<(String, f64)>) = self
			.run(|mut conn| async move {
				pipe()
					.atomic()
					.cmd("ZREMRANGEBYSCORE")
					.arg(key)
					.arg("-inf")
					.arg(format!("({cutoff_ms}"))
					.ignore()
					.cmd("ZCARD")
					.arg(key)
					.cmd("ZRANGE")
					.arg(key)
					.arg(0)
					.arg(0)
					.arg("WITHSCORES")
					.query_async(&mut conn)
					.await
			})
			.await?;

		Ok(WindowSnapshot {
			count,
			oldest_ms: oldest.first().map(|(_, score)| *score as i64),
		})
	}

	async fn window_record(
		&self,
		key: &str,
		at_ms: i64,
		member: &str,
		ttl: Duration,
	) -> StoreResult<()> {
		self.run(|mut conn| async move {
			pipe()
				.atomic()
				.cmd("ZADD")
				.arg(key)
				.arg(at_ms)
				.arg(member)
				.ignore()
				.cmd("PEXPIRE")
				.arg(key)
				.arg(millis(ttl))
				.ignore()
				.query_async(&mut conn)
				.await
		})
		.await
	}

	async fn increment_until(&self, key: &str, expire_at: i64) -> StoreResult<u64> {
		self.run(|mut conn| async move {
			self.increment_until
				.key(key)
				.arg(expire_at)
				.invoke_async(&mut conn)
				.await
		})
		.await
	}

	async fn get(&self, key: &str) -> StoreResult<Option<String>> {
		self.run(|mut conn| async move { cmd("GET").arg(key).query_async(&mut conn).await })
			.await
	}

	async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
		self.run(|mut conn| async move {
			cmd("SET")
				.arg(key)
				.arg(value)
				.arg("PX")
				.arg(millis(ttl))
				.query_async(&mut conn)
				.await
		})
		.await
	}

	async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
		let reply: Option<String> = self
			.run(|mut conn| async move {
				cmd("SET")
					.arg(key)
					.arg(value)
					.arg("NX")
					.arg("PX")
					.arg(millis(ttl))
					.query_async(&mut conn)
					.await
			})
			.await?;
		Ok(reply.is_some())
	}

	async fn remove(&self, key: &str) -> StoreResult<()> {
		self.run(|mut conn| async move { cmd("DEL").arg(key).query_async(&mut conn).await })
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transport_errors_are_degraded() {
		let refused = RedisError::from((ErrorKind::IoError, "connection refused"));
		assert!(classify(refused).is_degraded());
	}

	#[test]
	fn reply_errors_are_backend() {
		let wrong_type = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
		assert!(matches!(classify(wrong_type), StoreError::Backend(_)));
	}

	#[test]
	fn invalid_url_is_rejected() {
		assert!(RedisStore::connect("not a url", Duration::from_millis(250)).is_err());
	}

	#[test]
	fn ttl_never_rounds_to_zero() {
		assert_eq!(millis(Duration::ZERO), 1);
		assert_eq!(millis(Duration::from_secs(30)), 30_000);
	}

	#[tokio::test]
	async fn unreachable_server_reports_degraded() {
		// Nothing listens on port 1; the call must fail within the bound.
		let store = RedisStore::connect("redis://127.0.0.1:1/", Duration::from_millis(300)).unwrap();
		let err = store.get("anything").await.unwrap_err();
		assert!(err.is_degraded(), "unexpected error: {err:?}");
	}
}
