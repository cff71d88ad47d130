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

//! Gateway error envelope
//!
//! Every stage error converges into [`GatewayError`], which renders as
//!
//! ```json
//! { "success": false, "error": { "code": "...", "message": "..." } }
//! ```
//!
//! with stage specific fields added to `error` and, for throttling, a `meta`
//! object carrying `retry_after` and `reset_at`.

use actix_web::{HttpResponse, http::StatusCode};
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::{
	auth::AuthError,
	dispatcher::DispatchError,
	idempotency::IdempotencyError,
	rate_limit::{HEADER_RETRY_AFTER, RateLimitError},
	request::GatewayResponse,
	scope::ScopeError,
	tenant::TenantError,
};

const UNAVAILABLE_MESSAGE: &str = "Service temporarily unavailable";

/// Error types for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
	#[error(transparent)]
	Auth(#[from] AuthError),
	#[error(transparent)]
	Tenant(#[from] TenantError),
	#[error(transparent)]
	Scope(#[from] ScopeError),
	#[error(transparent)]
	RateLimited(#[from] RateLimitError),
	#[error(transparent)]
	Idempotency(#[from] IdempotencyError),
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
	#[error("No route for {method} {path}")]
	NotFound { method: String, path: String },
}

impl GatewayError {
	pub fn status(&self) -> StatusCode {
		match self {
			GatewayError::Auth(e) => e.status(),
			GatewayError::Tenant(e) => e.status(),
			GatewayError::Scope(_) => StatusCode::FORBIDDEN,
			GatewayError::RateLimited(e) => e.http_status(),
			GatewayError::Idempotency(e) => e.status(),
			GatewayError::Dispatch(e) => e.status(),
			GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
		}
	}

	pub fn code(&self) -> &'static str {
		match self {
			GatewayError::Auth(e) => e.code(),
			GatewayError::Tenant(e) => e.code(),
			GatewayError::Scope(_) => "INSUFFICIENT_SCOPE",
			GatewayError::RateLimited(e) => e.code(),
			GatewayError::Idempotency(e) => e.code(),
			GatewayError::Dispatch(e) => e.code(),
			GatewayError::NotFound { .. } => "NOT_FOUND",
		}
	}

	/// Text shown to the caller. Infrastructure details stay in the logs.
	pub fn message(&self) -> String {
		match self {
			GatewayError::Auth(AuthError::Directory(_))
			| GatewayError::Tenant(TenantError::Directory(_)) => UNAVAILABLE_MESSAGE.to_string(),
			GatewayError::Dispatch(DispatchError::Upstream(_)) => {
				"The upstream service could not be reached".to_string()
			}
			other => other.to_string(),
		}
	}

	pub fn to_response(&self) -> GatewayResponse {
		let mut error = Map::new();
		error.insert("code".to_string(), json!(self.code()));
		error.insert("message".to_string(), json!(self.message()));

		let mut envelope = Map::new();
		envelope.insert("success".to_string(), json!(false));

		match self {
			GatewayError::Scope(e) => {
				error.insert("required_scopes".to_string(), json!(e.required));
				error.insert("granted_scopes".to_string(), json!(e.granted));
			}
			GatewayError::Tenant(TenantError::CrossTenant { restaurant_id }) => {
				error.insert("restaurant_id".to_string(), json!(restaurant_id));
			}
			GatewayError::RateLimited(e) => {
				let reset_at = e.status().reset_at;
				envelope.insert(
					"meta".to_string(),
					json!({
						"retry_after": e.retry_after(),
						"reset_at": rfc3339(reset_at),
					}),
				);
			}
			_ => {}
		}
		envelope.insert("error".to_string(), Value::Object(error));

		let mut response = GatewayResponse::json(self.status(), &Value::Object(envelope));
		if let GatewayError::RateLimited(e) = self {
			e.status().apply(&mut response);
			response.set_header(HEADER_RETRY_AFTER, &e.retry_after().to_string());
		}
		response
	}
}

fn rfc3339(unix_secs: i64) -> Value {
	DateTime::from_timestamp(unix_secs, 0)
		.map(|at| json!(at.to_rfc3339_opts(SecondsFormat::Secs, true)))
		.unwrap_or(Value::Null)
}

impl actix_web::ResponseError for GatewayError {
	fn status_code(&self) -> StatusCode {
		self.status()
	}

	fn error_response(&self) -> HttpResponse {
		self.to_response().into_http()
	}
}
