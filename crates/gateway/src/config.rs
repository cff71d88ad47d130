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

//! Gateway configuration
//!
//! Configuration is read from an optional TOML file and overlaid with
//! `GATEWAY__SECTION__KEY` environment variables, e.g.
//! `GATEWAY__STORE__REDIS_URL=redis://cache:6379/0`. Every field has a default
//! so an empty file yields a runnable (if route-less) gateway.

use std::{collections::HashMap, env, time::Duration};

use actix_web::http::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Logging configuration constants
/// Default log level (can be overridden by RUST_LOG environment variable)
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Log directory component name
pub const LOG_COMPONENT_NAME: &str = "gateway";

/// Default console output enabled (can be overridden by LOG_TO_CONSOLE environment variable)
pub const DEFAULT_LOG_TO_CONSOLE: bool = false;

/// Config file used when neither a CLI argument nor GATEWAY_CONFIG is given
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

// Server configuration constants
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Default maximum HTTP request body size in bytes
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

// Shared store constants
/// Upper bound for a single store call, connection establishment included
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;

// Downstream constants
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:9000";

pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_DIRECTORY_SEED_PATH: &str = "config/directory.json";

// Rate limiting constants
/// Plan every caller falls back to; always defined even if not configured
pub const FREE_PLAN: &str = "free";

pub const FREE_PLAN_REQUESTS_PER_MINUTE: u64 = 60;

pub const FREE_PLAN_BURST: u64 = 10;

pub const FREE_PLAN_DAILY_LIMIT: u64 = 1_000;

/// Sliding window length in seconds
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// Extra lifetime given to a window key after its last write
pub const RATE_WINDOW_GRACE_SECS: u64 = 10;

/// Retry hint returned when writes are refused during a store outage
pub const FAIL_CLOSED_RETRY_AFTER_SECS: u64 = 60;

/// Lifetime of a local fallback bucket
pub const DEFAULT_FALLBACK_BUCKET_TTL_SECS: u64 = 120;

/// Upper bound on local fallback buckets held by one process
pub const DEFAULT_FALLBACK_MAX_BUCKETS: u64 = 100_000;

// Idempotency constants
pub const DEFAULT_IDEMPOTENCY_RECORD_TTL_SECS: u64 = 24 * 60 * 60;

pub const DEFAULT_IDEMPOTENCY_CLAIM_TTL_SECS: u64 = 30;

/// Error raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("Failed to load configuration: {0}")]
	Load(#[from] ::config::ConfigError),
	#[error("Invalid configuration: {0}")]
	Invalid(String),
}

/// Request quota of a plan or of a single client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
	pub requests_per_minute: u64,
	/// Advertised only; the sliding window does not enforce it
	#[serde(default)]
	pub burst: u64,
	/// Zero disables the daily cap
	#[serde(default)]
	pub daily_limit: u64,
}

impl RateLimits {
	pub const FREE: RateLimits = RateLimits {
		requests_per_minute: FREE_PLAN_REQUESTS_PER_MINUTE,
		burst: FREE_PLAN_BURST,
		daily_limit: FREE_PLAN_DAILY_LIMIT,
	};
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub bind_addr: String,
	/// Defaults to the number of CPUs
	pub workers: Option<usize>,
	pub max_body_bytes: usize,
	/// Use the first `X-Forwarded-For` hop as caller address
	pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			bind_addr: DEFAULT_BIND_ADDR.to_string(),
			workers: None,
			max_body_bytes: DEFAULT_MAX_BODY_BYTES,
			trust_forwarded_for: false,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
	/// When unset the gateway runs on a process-local store
	pub redis_url: Option<String>,
	pub timeout_ms: u64,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			redis_url: None,
			timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
		}
	}
}

impl StoreConfig {
	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
	pub url: String,
	pub timeout_ms: u64,
}

impl Default for BackendConfig {
	fn default() -> Self {
		Self {
			url: DEFAULT_BACKEND_URL.to_string(),
			timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
	pub seed_path: String,
}

impl Default for DirectoryConfig {
	fn default() -> Self {
		Self {
			seed_path: DEFAULT_DIRECTORY_SEED_PATH.to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
	pub default_plan: String,
	pub window_secs: u64,
	pub fallback_bucket_ttl_secs: u64,
	pub fallback_max_buckets: u64,
	/// Offset used for daily quotas when the client has none of its own
	pub daily_reset_utc_offset_minutes: i32,
	pub plans: HashMap<String, RateLimits>,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			default_plan: FREE_PLAN.to_string(),
			window_secs: DEFAULT_RATE_WINDOW_SECS,
			fallback_bucket_ttl_secs: DEFAULT_FALLBACK_BUCKET_TTL_SECS,
			fallback_max_buckets: DEFAULT_FALLBACK_MAX_BUCKETS,
			daily_reset_utc_offset_minutes: 0,
			plans: HashMap::new(),
		}
	}
}

impl RateLimitConfig {
	/// Look up a plan by name. `free` resolves even when not configured.
	pub fn plan(&self, name: &str) -> Option<RateLimits> {
		self.plans
			.get(name)
			.copied()
			.or_else(|| (name == FREE_PLAN).then_some(RateLimits::FREE))
	}

	pub fn default_limits(&self) -> RateLimits {
		self.plan(&self.default_plan).unwrap_or(RateLimits::FREE)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
	pub record_ttl_secs: u64,
	pub claim_ttl_secs: u64,
}

impl Default for IdempotencyConfig {
	fn default() -> Self {
		Self {
			record_ttl_secs: DEFAULT_IDEMPOTENCY_RECORD_TTL_SECS,
			claim_ttl_secs: DEFAULT_IDEMPOTENCY_CLAIM_TTL_SECS,
		}
	}
}

/// Path parameter whose value names a restaurant-owning entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBinding {
	pub param: String,
	pub entity: String,
}

/// One entry of the route table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
	pub name: String,
	pub method: String,
	/// actix path pattern, e.g. `/api/v1/tables/{table_id}/orders`
	pub path: String,
	/// Any one of these grants access; empty means any identity
	#[serde(default)]
	pub scopes: Vec<String>,
	/// Tried in order when resolving the restaurant
	#[serde(default)]
	pub bindings: Vec<RouteBinding>,
	/// Skip authentication and scope checks
	#[serde(default)]
	pub public: bool,
}

impl RouteSpec {
	pub fn http_method(&self) -> Result<Method, ConfigError> {
		Method::from_bytes(self.method.to_ascii_uppercase().as_bytes()).map_err(|_| {
			ConfigError::Invalid(format!(
				"route {}: unknown method {}",
				self.name, self.method
			))
		})
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.name.trim().is_empty() {
			return Err(ConfigError::Invalid(format!(
				"route {} has no name",
				self.path
			)));
		}
		if !self.path.starts_with('/') {
			return Err(ConfigError::Invalid(format!(
				"route {}: path must start with '/'",
				self.name
			)));
		}
		self.http_method()?;
		for binding in &self.bindings {
			if !self.path.contains(&format!("{{{}}}", binding.param)) {
				return Err(ConfigError::Invalid(format!(
					"route {}: binding parameter {} does not appear in {}",
					self.name, binding.param, self.path
				)));
			}
		}
		Ok(())
	}
}

/// Gateway service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
	pub server: ServerConfig,
	pub store: StoreConfig,
	pub backend: BackendConfig,
	pub directory: DirectoryConfig,
	pub rate_limit: RateLimitConfig,
	pub idempotency: IdempotencyConfig,
	pub routes: Vec<RouteSpec>,
}

impl GatewayConfig {
	/// Load configuration from `path`, `GATEWAY_CONFIG` or the default path,
	/// in that order, overlaid with `GATEWAY__*` environment variables.
	///
	/// A missing file is not an error; a malformed one is.
	pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
		dotenv::dotenv().ok();

		let path = path
			.map(str::to_string)
			.or_else(|| env::var("GATEWAY_CONFIG").ok())
			.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

		let cfg = ::config::Config::builder()
			.add_source(::config::File::with_name(&path).required(false))
			.add_source(
				::config::Environment::with_prefix("GATEWAY")
					.separator("__")
					.try_parsing(true),
			)
			.build()?;

		let parsed: GatewayConfig = cfg.try_deserialize()?;
		parsed.validate()?;
		Ok(parsed)
	}

	/// Parse a TOML document without consulting the environment.
	pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
		let cfg = ::config::Config::builder()
			.add_source(::config::File::from_str(source, ::config::FileFormat::Toml))
			.build()?;
		let parsed: GatewayConfig = cfg.try_deserialize()?;
		parsed.validate()?;
		Ok(parsed)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.rate_limit.window_secs == 0 {
			return Err(ConfigError::Invalid(
				"rate_limit.window_secs must be > 0".to_string(),
			));
		}
		if self.rate_limit.plan(&self.rate_limit.default_plan).is_none() {
			return Err(ConfigError::Invalid(format!(
				"rate_limit.default_plan {} is not defined",
				self.rate_limit.default_plan
			)));
		}
		if !(-14 * 60..=14 * 60).contains(&self.rate_limit.daily_reset_utc_offset_minutes) {
			return Err(ConfigError::Invalid(
				"rate_limit.daily_reset_utc_offset_minutes must be within +/-14h".to_string(),
			));
		}
		if self.store.timeout_ms == 0 {
			return Err(ConfigError::Invalid(
				"store.timeout_ms must be > 0".to_string(),
			));
		}
		if self.idempotency.claim_ttl_secs == 0 || self.idempotency.record_ttl_secs == 0 {
			return Err(ConfigError::Invalid(
				"idempotency TTLs must be > 0".to_string(),
			));
		}

		let mut names = std::collections::HashSet::new();
		for route in &self.routes {
			route.validate()?;
			if !names.insert(route.name.as_str()) {
				return Err(ConfigError::Invalid(format!(
					"duplicate route name {}",
					route.name
				)));
			}
		}
		Ok(())
	}

	pub fn workers(&self) -> usize {
		self.server.workers.unwrap_or_else(num_cpus::get)
	}
}
