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

//! Hand-off of admitted requests to the business backend
//!
//! The pipeline only knows the [`RequestHandler`] trait. [`HttpForwarder`]
//! is the production implementation and proxies over HTTP with `reqwest`.

use std::time::Duration;

use actix_web::http::{
	StatusCode,
	header::{HeaderName, HeaderValue},
};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
	config::{BackendConfig, RouteSpec},
	identity::Identity,
	request::{GatewayRequest, GatewayResponse},
	tenant::TenantContext,
};

pub const HEADER_REQUEST_ID: &str = "X-Request-Id";
pub const HEADER_GATEWAY_RESTAURANT: &str = "X-Gateway-Restaurant-Id";
pub const HEADER_GATEWAY_TENANT: &str = "X-Gateway-Tenant-Id";
pub const HEADER_GATEWAY_SUBJECT: &str = "X-Gateway-Subject";
pub const HEADER_GATEWAY_SCOPES: &str = "X-Gateway-Scopes";

/// Never forwarded in either direction
const HOP_BY_HOP: [&str; 9] = [
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailers",
	"transfer-encoding",
	"upgrade",
	"content-length",
];

/// Never forwarded to the backend
const GATEWAY_ONLY: [&str; 3] = ["host", "x-api-secret", "authorization"];

#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("Backend did not respond within {0:?}")]
	Timeout(Duration),
	#[error("Backend request failed: {0}")]
	Upstream(String),
}

impl DispatchError {
	pub fn code(&self) -> &'static str {
		match self {
			DispatchError::Timeout(_) => "UPSTREAM_TIMEOUT",
			DispatchError::Upstream(_) => "BAD_GATEWAY",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
			DispatchError::Upstream(_) => StatusCode::BAD_GATEWAY,
		}
	}
}

/// An admitted request together with what the gateway learned about it
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
	pub request: &'a GatewayRequest,
	pub route: &'a RouteSpec,
	pub identity: Option<&'a Identity>,
	pub tenant: Option<&'a TenantContext>,
}

/// Downstream business handler
#[async_trait]
pub trait RequestHandler: Send + Sync {
	async fn handle(&self, dispatch: DispatchRequest<'_>) -> Result<GatewayResponse, DispatchError>;
}

/// Proxies admitted requests to `backend.url`
pub struct HttpForwarder {
	client: reqwest::Client,
	base_url: String,
	timeout: Duration,
}

impl HttpForwarder {
	pub fn new(config: &BackendConfig) -> Result<Self, DispatchError> {
		let timeout = Duration::from_millis(config.timeout_ms);
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| DispatchError::Upstream(format!("failed to build HTTP client: {e}")))?;
		Ok(Self {
			client,
			base_url: config.url.trim_end_matches('/').to_string(),
			timeout,
		})
	}

	fn target(&self, request: &GatewayRequest) -> String {
		format!("{}{}", self.base_url, request.uri())
	}
}

#[async_trait]
impl RequestHandler for HttpForwarder {
	async fn handle(&self, dispatch: DispatchRequest<'_>) -> Result<GatewayResponse, DispatchError> {
		let request = dispatch.request;
		let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
			.map_err(|e| DispatchError::Upstream(e.to_string()))?;

		let mut builder = self.client.request(method, self.target(request));
		for (name, value) in forwarded_headers(&dispatch) {
			builder = builder.header(name, value);
		}

		let response = builder
			.body(request.body.clone())
			.send()
			.await
			.map_err(|e| self.classify(e, &dispatch))?;

		let status = StatusCode::from_u16(response.status().as_u16())
			.map_err(|e| DispatchError::Upstream(e.to_string()))?;
		let mut forwarded = GatewayResponse::new(status);
		for (name, value) in response.headers() {
			if is_hop_by_hop(name.as_str()) {
				continue;
			}
			if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes())
				&& let Ok(value) = HeaderValue::from_bytes(value.as_bytes())
			{
				forwarded.headers.append(name, value);
			}
		}

		let body = response
			.bytes()
			.await
			.map_err(|e| self.classify(e, &dispatch))?;

		debug!(
			target: "gateway::dispatcher",
			route = %dispatch.route.name,
			request_id = %request.request_id,
			status = status.as_u16(),
			"Backend responded"
		);
		Ok(forwarded.with_body(body))
	}
}

impl HttpForwarder {
	fn classify(&self, e: reqwest::Error, dispatch: &DispatchRequest<'_>) -> DispatchError {
		warn!(
			target: "gateway::dispatcher",
			route = %dispatch.route.name,
			request_id = %dispatch.request.request_id,
			error = %e,
			"Backend call failed"
		);
		if e.is_timeout() {
			DispatchError::Timeout(self.timeout)
		} else {
			DispatchError::Upstream(e.to_string())
		}
	}
}

fn is_hop_by_hop(name: &str) -> bool {
	HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// End-to-end request headers plus the gateway's own annotations.
pub fn forwarded_headers(dispatch: &DispatchRequest<'_>) -> Vec<(String, Vec<u8>)> {
	let mut headers: Vec<(String, Vec<u8>)> = dispatch
		.request
		.headers
		.iter()
		.filter(|(name, _)| {
			let name = name.as_str();
			!is_hop_by_hop(name)
				&& !GATEWAY_ONLY.iter().any(|h| name.eq_ignore_ascii_case(h))
				&& !name.to_ascii_lowercase().starts_with("x-gateway-")
		})
		.map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
		.collect();

	let mut annotate = |name: &str, value: String| {
		headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
		headers.push((name.to_string(), value.into_bytes()));
	};

	annotate(HEADER_REQUEST_ID, dispatch.request.request_id.clone());
	if let Some(tenant) = dispatch.tenant {
		annotate(HEADER_GATEWAY_RESTAURANT, tenant.restaurant_id.clone());
	}
	if let Some(identity) = dispatch.identity {
		if let Some(tenant_id) = &identity.tenant_id {
			annotate(HEADER_GATEWAY_TENANT, tenant_id.clone());
		}
		annotate(HEADER_GATEWAY_SUBJECT, identity.subject());
		let scopes: Vec<&str> = identity.scopes.iter().map(String::as_str).collect();
		annotate(HEADER_GATEWAY_SCOPES, scopes.join(" "));
	}
	headers
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use actix_web::http::Method;

	use super::*;
	use crate::{
		identity::{AuthMethod, Role, SubjectType},
		tenant::ResolvedFrom,
	};

	fn route() -> RouteSpec {
		RouteSpec {
			name: "orders.create".to_string(),
			method: "POST".to_string(),
			path: "/api/v1/orders".to_string(),
			scopes: vec!["orders:write".to_string()],
			bindings: vec![],
			public: false,
		}
	}

	fn header<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a str> {
		headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.and_then(|(_, v)| std::str::from_utf8(v).ok())
	}

	#[test]
	fn strips_credentials_and_hop_headers() {
		let request = GatewayRequest::new(Method::POST, "/api/v1/orders")
			.with_header("X-API-Key", "key")
			.with_header("X-API-Secret", "secret")
			.with_header("Authorization", "Bearer abc")
			.with_header("Connection", "keep-alive")
			.with_header("X-Gateway-Subject", "spoofed")
			.with_header("Accept-Language", "it");
		let route = route();
		let identity = Identity {
			subject_type: SubjectType::Client,
			client_id: Some("c-1".to_string()),
			user_id: None,
			tenant_id: Some("t-1".to_string()),
			restaurant_id: Some("r-1".to_string()),
			role: Role::Staff,
			scopes: BTreeSet::from(["orders:write".to_string(), "menu:*".to_string()]),
			auth_method: AuthMethod::ApiKey,
			plan: None,
			custom_limits: None,
			utc_offset_minutes: None,
		};
		let tenant = TenantContext {
			restaurant_id: "r-1".to_string(),
			resolved_from: ResolvedFrom::User,
		};

		let headers = forwarded_headers(&DispatchRequest {
			request: &request,
			route: &route,
			identity: Some(&identity),
			tenant: Some(&tenant),
		});

		assert_eq!(header(&headers, "x-api-secret"), None);
		assert_eq!(header(&headers, "authorization"), None);
		assert_eq!(header(&headers, "connection"), None);
		assert_eq!(header(&headers, "x-api-key"), Some("key"));
		assert_eq!(header(&headers, "accept-language"), Some("it"));
		assert_eq!(header(&headers, HEADER_REQUEST_ID), Some(request.request_id.as_str()));
		assert_eq!(header(&headers, HEADER_GATEWAY_RESTAURANT), Some("r-1"));
		assert_eq!(header(&headers, HEADER_GATEWAY_TENANT), Some("t-1"));
		assert_eq!(header(&headers, HEADER_GATEWAY_SUBJECT), Some("client:c-1"));
		assert_eq!(header(&headers, HEADER_GATEWAY_SCOPES), Some("menu:* orders:write"));
	}

	#[tokio::test]
	async fn unreachable_backend_is_bad_gateway() {
		let forwarder = HttpForwarder::new(&BackendConfig {
			url: "http://127.0.0.1:1".to_string(),
			timeout_ms: 2_000,
		})
		.unwrap();
		let request = GatewayRequest::new(Method::GET, "/api/v1/menu");
		let route = route();
		let err = forwarder
			.handle(DispatchRequest {
				request: &request,
				route: &route,
				identity: None,
				tenant: None,
			})
			.await
			.unwrap_err();
		assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
		assert_eq!(err.code(), "BAD_GATEWAY");
	}
}
