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

//! Replay protection for mutating requests
//!
//! A client may attach `X-Idempotency-Key` to POST, PUT and PATCH requests.
//! The first request with a key is dispatched and its response recorded; a
//! later request with the same key and the same method, path and body gets the
//! recorded response back without reaching the handler.
//!
//! Store failures never fail the request. Without the store the guard simply
//! stops protecting against duplicates.

use std::{net::IpAddr, sync::Arc, time::Duration};

use actix_web::http::{Method, StatusCode};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tavola_store::{CounterStore, StoreError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
	config::IdempotencyConfig,
	identity::{Identity, caller_key},
	request::{GatewayRequest, GatewayResponse},
};

pub const HEADER_IDEMPOTENCY_KEY: &str = "X-Idempotency-Key";
pub const HEADER_REPLAYED: &str = "X-Idempotent-Replayed";
pub const HEADER_ORIGINAL_REQUEST_ID: &str = "X-Idempotent-Original-Request-Id";

pub const MAX_KEY_LEN: usize = 64;

/// Response headers kept in a record
const PERSISTED_HEADERS: [&str; 3] = ["content-type", "content-language", "location"];

#[derive(Debug, Error)]
pub enum IdempotencyError {
	#[error("Idempotency key must be 1-64 characters of A-Z, a-z, 0-9, '-' or '_'")]
	InvalidKey,
	#[error("Idempotency key was already used for a different request")]
	KeyReused,
	#[error("A request with this idempotency key is still being processed")]
	InProgress,
}

impl IdempotencyError {
	pub fn code(&self) -> &'static str {
		match self {
			IdempotencyError::InvalidKey => "INVALID_IDEMPOTENCY_KEY",
			IdempotencyError::KeyReused => "IDEMPOTENCY_KEY_REUSED",
			IdempotencyError::InProgress => "IDEMPOTENCY_KEY_IN_PROGRESS",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			IdempotencyError::InvalidKey => StatusCode::BAD_REQUEST,
			IdempotencyError::KeyReused => StatusCode::UNPROCESSABLE_ENTITY,
			IdempotencyError::InProgress => StatusCode::CONFLICT,
		}
	}
}

/// Whether `key` is 1-64 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_key(key: &str) -> bool {
	(1..=MAX_KEY_LEN).contains(&key.len())
		&& key
			.bytes()
			.all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// The idempotency key of `request`, if it carries one and the method takes one.
///
/// Runs before any store access, so malformed keys are refused cheaply.
pub fn key_from(request: &GatewayRequest) -> Result<Option<String>, IdempotencyError> {
	if !matches!(request.method, Method::POST | Method::PUT | Method::PATCH) {
		return Ok(None);
	}
	// A header that is present but not valid text is malformed too.
	let Some(raw) = request.headers.get(HEADER_IDEMPOTENCY_KEY) else {
		return Ok(None);
	};
	match raw.to_str() {
		Ok(key) if is_valid_key(key) => Ok(Some(key.to_string())),
		_ => Err(IdempotencyError::InvalidKey),
	}
}

/// SHA-256 over method, path and raw body, hex encoded.
pub fn request_hash(request: &GatewayRequest) -> String {
	let mut hasher = Sha256::new();
	hasher.update(request.method.as_str().as_bytes());
	hasher.update(b"\n");
	hasher.update(request.path.as_bytes());
	hasher.update(b"\n");
	hasher.update(&request.body);
	hex::encode(hasher.finalize())
}

/// Caller a record belongs to
///
/// A user acting through an integration client gets its own namespace under
/// that client, so two users of one client never see each other's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOwner {
	pub client_id: Option<String>,
	pub user_id: Option<String>,
	scope: String,
}

impl RecordOwner {
	/// Owner of a request made by `identity`, or by `ip` when anonymous.
	pub fn of(identity: Option<&Identity>, ip: Option<IpAddr>) -> Self {
		let client_id = identity.and_then(|i| i.client_id.clone());
		let user_id = identity.and_then(|i| i.user_id.clone());
		let scope = match (&client_id, &user_id) {
			(Some(client), Some(user)) => format!("client:{client}:user:{user}"),
			(Some(client), None) => format!("client:{client}"),
			(None, Some(user)) => format!("user:{user}"),
			(None, None) => caller_key(None, ip),
		};
		Self {
			client_id,
			user_id,
			scope,
		}
	}

	/// Store key component; distinct for every distinct caller.
	pub fn scope(&self) -> &str {
		&self.scope
	}
}

/// Stored outcome of the first request made with a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
	pub key: String,
	/// Owner scope the record is stored under
	pub scope: String,
	#[serde(default)]
	pub client_id: Option<String>,
	#[serde(default)]
	pub user_id: Option<String>,
	pub request_hash: String,
	pub status_code: u16,
	/// Base64
	pub response_body: String,
	pub response_headers: Vec<(String, String)>,
	pub request_id: String,
	pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
	fn capture(ticket: &Ticket, response: &GatewayResponse, now: DateTime<Utc>) -> Self {
		let response_headers = PERSISTED_HEADERS
			.iter()
			.filter_map(|name| {
				response
					.header(name)
					.map(|value| (name.to_string(), value.to_string()))
			})
			.collect();
		Self {
			key: ticket.key.clone(),
			scope: ticket.owner.scope.clone(),
			client_id: ticket.owner.client_id.clone(),
			user_id: ticket.owner.user_id.clone(),
			request_hash: ticket.request_hash.clone(),
			status_code: response.status.as_u16(),
			response_body: STANDARD.encode(&response.body),
			response_headers,
			request_id: ticket.request_id.clone(),
			created_at: now,
		}
	}

	/// Rebuild the recorded response, marked as a replay.
	pub fn replay(&self) -> Result<GatewayResponse, IdempotencyRecordError> {
		let status = StatusCode::from_u16(self.status_code)
			.map_err(|_| IdempotencyRecordError::Corrupt("status code"))?;
		let body = STANDARD
			.decode(&self.response_body)
			.map_err(|_| IdempotencyRecordError::Corrupt("body"))?;

		let mut response = GatewayResponse::new(status).with_body(body);
		for (name, value) in &self.response_headers {
			response.set_header(name, value);
		}
		response.set_header(HEADER_REPLAYED, "true");
		response.set_header(HEADER_ORIGINAL_REQUEST_ID, &self.request_id);
		Ok(response)
	}
}

#[derive(Debug, Error)]
pub enum IdempotencyRecordError {
	#[error("Malformed idempotency record: bad {0}")]
	Corrupt(&'static str),
}

/// State carried from [`IdempotencyGuard::begin`] to [`IdempotencyGuard::complete`]
#[derive(Debug, Clone)]
pub struct Ticket {
	key: String,
	owner: RecordOwner,
	request_hash: String,
	request_id: String,
	claimed: bool,
}

impl Ticket {
	pub fn key(&self) -> &str {
		&self.key
	}

	/// Whether this request holds the in-flight claim on its key.
	pub fn is_claimed(&self) -> bool {
		self.claimed
	}
}

#[derive(Debug)]
pub enum Admission {
	/// Dispatch, then hand the ticket back to `complete`
	Proceed(Ticket),
	/// Return this response without dispatching
	Replay(GatewayResponse),
}

pub struct IdempotencyGuard {
	store: Arc<dyn CounterStore>,
	record_ttl: Duration,
	claim_ttl: Duration,
}

impl IdempotencyGuard {
	pub fn new(store: Arc<dyn CounterStore>, config: &IdempotencyConfig) -> Self {
		Self {
			store,
			record_ttl: Duration::from_secs(config.record_ttl_secs),
			claim_ttl: Duration::from_secs(config.claim_ttl_secs),
		}
	}

	/// Decide whether a keyed request is dispatched or answered from its record.
	///
	/// # Arguments
	/// * `owner` - Caller the record belongs to
	/// * `key` - Validated idempotency key
	/// * `request` - The request being admitted
	///
	/// # Returns
	/// * `Ok(Admission::Replay)` - Same key, same request, recorded response
	/// * `Ok(Admission::Proceed)` - No usable record, dispatch normally
	/// * `Err(KeyReused)` - Same key recorded for a different request
	/// * `Err(InProgress)` - Another request holds the claim on this key
	pub async fn begin(
		&self,
		owner: &RecordOwner,
		key: &str,
		request: &GatewayRequest,
	) -> Result<Admission, IdempotencyError> {
		let scope = owner.scope();
		let mut ticket = Ticket {
			key: key.to_string(),
			owner: owner.clone(),
			request_hash: request_hash(request),
			request_id: request.request_id.clone(),
			claimed: false,
		};

		if let Some(admission) = self.lookup(&ticket).await? {
			return Ok(admission);
		}

		match self
			.store
			.put_if_absent(&claim_key(scope, key), &ticket.request_id, self.claim_ttl)
			.await
		{
			Ok(true) => {
				ticket.claimed = true;
				// The holder of the previous claim may have finished in between.
				let found = self.lookup(&ticket).await;
				if !matches!(found, Ok(None)) {
					self.release(&ticket).await;
				}
				if let Some(admission) = found? {
					return Ok(admission);
				}
			}
			Ok(false) => {
				debug!(target: "gateway::idempotency", scope = %scope, key = %key, "Key claimed by a concurrent request");
				return Err(IdempotencyError::InProgress);
			}
			Err(e) => log_store_failure(&e, scope, key, "claim"),
		}

		Ok(Admission::Proceed(ticket))
	}

	/// Record the handler's response when its status is in `[200, 500)`, then
	/// release the claim. Failures are logged and otherwise ignored.
	pub async fn complete(&self, ticket: Ticket, response: &GatewayResponse) {
		self.complete_at(ticket, response, Utc::now()).await
	}

	pub async fn complete_at(&self, ticket: Ticket, response: &GatewayResponse, now: DateTime<Utc>) {
		let status = response.status.as_u16();
		if (200..500).contains(&status) {
			let record = IdempotencyRecord::capture(&ticket, response, now);
			match serde_json::to_string(&record) {
				Ok(encoded) => {
					if let Err(e) = self
						.store
						.put(&record_key(&ticket.owner.scope, &ticket.key), &encoded, self.record_ttl)
						.await
					{
						log_store_failure(&e, &ticket.owner.scope, &ticket.key, "persist");
					}
				}
				Err(e) => warn!(target: "gateway::idempotency", key = %ticket.key, error = %e, "Failed to encode idempotency record"),
			}
		} else {
			debug!(target: "gateway::idempotency", key = %ticket.key, status, "Response not recorded");
		}
		self.release(&ticket).await;
	}

	async fn lookup(&self, ticket: &Ticket) -> Result<Option<Admission>, IdempotencyError> {
		let stored = match self
			.store
			.get(&record_key(&ticket.owner.scope, &ticket.key))
			.await
		{
			Ok(stored) => stored,
			Err(e) => {
				log_store_failure(&e, &ticket.owner.scope, &ticket.key, "lookup");
				return Ok(None);
			}
		};
		let Some(stored) = stored else {
			return Ok(None);
		};

		let record = match serde_json::from_str::<IdempotencyRecord>(&stored) {
			Ok(record) => record,
			Err(e) => {
				warn!(target: "gateway::idempotency", key = %ticket.key, error = %e, "Ignoring unreadable idempotency record");
				return Ok(None);
			}
		};

		if record.request_hash != ticket.request_hash {
			warn!(
				target: "gateway::idempotency",
				scope = %ticket.owner.scope,
				key = %ticket.key,
				original_request_id = %record.request_id,
				"Idempotency key reused for a different request"
			);
			return Err(IdempotencyError::KeyReused);
		}

		match record.replay() {
			Ok(response) => {
				debug!(target: "gateway::idempotency", key = %ticket.key, original_request_id = %record.request_id, "Replaying recorded response");
				Ok(Some(Admission::Replay(response)))
			}
			Err(e) => {
				warn!(target: "gateway::idempotency", key = %ticket.key, error = %e, "Ignoring unreadable idempotency record");
				Ok(None)
			}
		}
	}

	async fn release(&self, ticket: &Ticket) {
		if !ticket.claimed {
			return;
		}
		if let Err(e) = self.store.remove(&claim_key(&ticket.owner.scope, &ticket.key)).await {
			log_store_failure(&e, &ticket.owner.scope, &ticket.key, "release");
		}
	}
}

fn record_key(scope: &str, key: &str) -> String {
	format!("idempotency:{scope}:{key}")
}

fn claim_key(scope: &str, key: &str) -> String {
	format!("idempotency:claim:{scope}:{key}")
}

fn log_store_failure(e: &StoreError, scope: &str, key: &str, operation: &str) {
	if e.is_degraded() {
		warn!(target: "gateway::idempotency", scope = %scope, key = %key, operation, error = %e, "Store degraded, continuing without replay protection");
	} else {
		error!(target: "gateway::idempotency", scope = %scope, key = %key, operation, error = %e, "Store command failed, continuing without replay protection");
	}
}
