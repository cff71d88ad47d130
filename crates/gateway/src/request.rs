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

//! Protocol-neutral request and response values
//!
//! The pipeline stages never see actix types directly. The HTTP adapter turns
//! an incoming request into a [`GatewayRequest`] once, and every stage returns
//! or forwards a [`GatewayResponse`] that is rendered back at the edge.

use std::{collections::HashMap, net::IpAddr};

use actix_web::{
	HttpRequest, HttpResponse,
	http::{
		Method, StatusCode,
		header::{HeaderMap, HeaderName, HeaderValue},
	},
	web::{self, Bytes},
};
use serde_json::Value;

/// An inbound request as seen by the pipeline
#[derive(Debug, Clone)]
pub struct GatewayRequest {
	pub method: Method,
	pub path: String,
	/// Raw query string without the leading `?`
	pub query: Option<String>,
	pub headers: HeaderMap,
	pub body: Bytes,
	/// Socket peer address
	pub peer_ip: Option<IpAddr>,
	/// Values captured by `{param}` segments of the matched route
	pub path_params: HashMap<String, String>,
	pub request_id: String,
}

impl GatewayRequest {
	pub fn new(method: Method, path: impl Into<String>) -> Self {
		Self {
			method,
			path: path.into(),
			query: None,
			headers: HeaderMap::new(),
			body: Bytes::new(),
			peer_ip: None,
			path_params: HashMap::new(),
			request_id: uuid::Uuid::new_v4().to_string(),
		}
	}

	/// Build from an actix request whose route has already been matched.
	pub fn from_http(req: &HttpRequest, body: Bytes, request_id: String) -> Self {
		let query = Some(req.query_string())
			.filter(|q| !q.is_empty())
			.map(str::to_string);
		let path_params = req
			.match_info()
			.iter()
			.map(|(name, value)| (name.to_string(), value.to_string()))
			.collect();

		Self {
			method: req.method().clone(),
			path: req.path().to_string(),
			query,
			headers: req.headers().clone(),
			body,
			peer_ip: req.peer_addr().map(|addr| addr.ip()),
			path_params,
			request_id,
		}
	}

	pub fn with_header(mut self, name: &str, value: &str) -> Self {
		if let Ok(name) = HeaderName::from_bytes(name.as_bytes())
			&& let Ok(value) = HeaderValue::from_str(value)
		{
			self.headers.insert(name, value);
		}
		self
	}

	pub fn with_query(mut self, query: impl Into<String>) -> Self {
		self.query = Some(query.into());
		self
	}

	pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = body.into();
		self
	}

	pub fn with_peer(mut self, ip: IpAddr) -> Self {
		self.peer_ip = Some(ip);
		self
	}

	pub fn with_path_param(mut self, name: &str, value: &str) -> Self {
		self.path_params.insert(name.to_string(), value.to_string());
		self
	}

	/// Header value as UTF-8, `None` when absent or not valid text.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|v| v.to_str().ok())
	}

	pub fn query_param(&self, name: &str) -> Option<String> {
		let query = self.query.as_deref()?;
		web::Query::<HashMap<String, String>>::from_query(query)
			.ok()
			.and_then(|params| params.into_inner().remove(name))
	}

	/// Path plus query string, as received.
	pub fn uri(&self) -> String {
		match &self.query {
			Some(query) => format!("{}?{}", self.path, query),
			None => self.path.clone(),
		}
	}

	/// POST, PUT, PATCH and DELETE.
	pub fn is_mutating(&self) -> bool {
		matches!(
			self.method,
			Method::POST | Method::PUT | Method::PATCH | Method::DELETE
		)
	}

	/// Caller address used for allow-lists and anonymous rate limiting.
	///
	/// When `trust_forwarded_for` is set the first `X-Forwarded-For` hop wins
	/// over the socket peer.
	pub fn client_ip(&self, trust_forwarded_for: bool) -> Option<IpAddr> {
		if trust_forwarded_for
			&& let Some(forwarded) = self.header("x-forwarded-for")
			&& let Some(first) = forwarded.split(',').next()
			&& let Ok(ip) = first.trim().parse()
		{
			return Some(ip);
		}
		self.peer_ip
	}
}

/// A response produced by a stage or by the downstream handler
#[derive(Debug, Clone)]
pub struct GatewayResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl GatewayResponse {
	pub fn new(status: StatusCode) -> Self {
		Self {
			status,
			headers: HeaderMap::new(),
			body: Bytes::new(),
		}
	}

	pub fn json(status: StatusCode, body: &Value) -> Self {
		let mut response = Self::new(status);
		response.body = Bytes::from(body.to_string());
		response.set_header("content-type", "application/json");
		response
	}

	pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = body.into();
		self
	}

	/// Insert or replace a header. Invalid names or values are skipped.
	pub fn set_header(&mut self, name: &str, value: &str) {
		if let Ok(name) = HeaderName::from_bytes(name.as_bytes())
			&& let Ok(value) = HeaderValue::from_str(value)
		{
			self.headers.insert(name, value);
		}
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|v| v.to_str().ok())
	}

	pub fn into_http(self) -> HttpResponse {
		let mut builder = HttpResponse::build(self.status);
		for (name, value) in self.headers.iter() {
			builder.append_header((name.clone(), value.clone()));
		}
		builder.body(self.body)
	}
}
