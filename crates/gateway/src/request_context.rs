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

//! Per-request identification
//!
//! Every request carries a `request_id`. It is taken from the incoming
//! `X-Request-Id` header when that value is usable, generated otherwise, and:
//!
//! - attached to every log line of the request;
//! - forwarded to the backend;
//! - echoed on the response;
//! - stored in idempotency records, so a replay can name the request that
//!   produced the original response.
//!
//! Incoming ids are only trusted if they are at most [`MAX_REQUEST_ID_LEN`]
//! characters of `[A-Za-z0-9._:-]`. Anything else is replaced and logged.

use actix_web::{
	HttpMessage, HttpRequest,
	dev::{ServiceRequest, ServiceResponse},
	http::header::{HeaderName, HeaderValue},
};
use tracing::warn;
use uuid::Uuid;

pub use crate::dispatcher::HEADER_REQUEST_ID;

pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Request context stored in the request extensions
#[derive(Clone, Debug)]
pub struct RequestContext {
	pub request_id: String,
}

impl RequestContext {
	/// Ensure a RequestContext exists for the given request, creating one if needed
	///
	/// # Arguments
	///
	/// * `req` - The HTTP service request (mutable to insert context into extensions)
	///
	/// # Returns
	///
	/// Returns the `RequestContext` (either existing or newly created).
	pub fn ensure(req: &mut ServiceRequest) -> Self {
		if let Some(ctx) = req.extensions().get::<RequestContext>() {
			return ctx.clone();
		}

		let incoming = req
			.headers()
			.get(HEADER_REQUEST_ID)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);

		let request_id = match incoming {
			Some(id) if is_valid_request_id(&id) => id,
			Some(id) => {
				let generated = Uuid::new_v4().to_string();
				warn!(
					target: "gateway::request",
					request_id = %generated,
					rejected_len = id.len(),
					"Invalid X-Request-Id, generated a new one"
				);
				generated
			}
			None => Uuid::new_v4().to_string(),
		};

		let ctx = RequestContext { request_id };
		req.extensions_mut().insert(ctx.clone());
		ctx
	}

	/// Extract RequestContext from an HTTP request if it exists
	pub fn from_http(req: &HttpRequest) -> Option<Self> {
		req.extensions().get::<RequestContext>().cloned()
	}

	/// Request id of `req`, generating one when no middleware assigned it.
	pub fn request_id_of(req: &HttpRequest) -> String {
		Self::from_http(req)
			.map(|ctx| ctx.request_id)
			.unwrap_or_else(|| Uuid::new_v4().to_string())
	}

	/// Add `X-Request-Id` to the response unless a handler already set it.
	pub fn write_response_headers<B>(&self, res: &mut ServiceResponse<B>) {
		let headers = res.headers_mut();
		if headers.get(HEADER_REQUEST_ID).is_none()
			&& let Ok(value) = HeaderValue::from_str(&self.request_id)
		{
			headers.insert(HeaderName::from_static("x-request-id"), value);
		}
	}
}

pub fn is_valid_request_id(id: &str) -> bool {
	(1..=MAX_REQUEST_ID_LEN).contains(&id.len())
		&& id
			.bytes()
			.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

#[cfg(test)]
mod tests {
	use actix_web::test::TestRequest;

	use super::*;

	#[test]
	fn request_id_syntax() {
		assert!(is_valid_request_id("2f1c1d0e-9f5b-4bb1-8b0d-0b7b5f0e4a11"));
		assert!(is_valid_request_id("lb:abc.123_x"));
		assert!(!is_valid_request_id(""));
		assert!(!is_valid_request_id("has space"));
		assert!(!is_valid_request_id(&"a".repeat(MAX_REQUEST_ID_LEN + 1)));
	}

	#[test]
	fn keeps_valid_incoming_id() {
		let mut req = TestRequest::default()
			.insert_header((HEADER_REQUEST_ID, "req-42"))
			.to_srv_request();
		let ctx = RequestContext::ensure(&mut req);
		assert_eq!(ctx.request_id, "req-42");
		// Second call returns the stored context.
		assert_eq!(RequestContext::ensure(&mut req).request_id, "req-42");
	}

	#[test]
	fn replaces_invalid_incoming_id() {
		let mut req = TestRequest::default()
			.insert_header((HEADER_REQUEST_ID, "bad id"))
			.to_srv_request();
		let ctx = RequestContext::ensure(&mut req);
		assert_ne!(ctx.request_id, "bad id");
		assert!(Uuid::parse_str(&ctx.request_id).is_ok());
	}
}
