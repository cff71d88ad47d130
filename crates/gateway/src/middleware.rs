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

use std::future::{Ready, ready};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use actix_web::{
	Error,
	dev::{Service, ServiceRequest, ServiceResponse, Transform},
};
use tracing::{Instrument, info, warn};

use crate::request_context::RequestContext;

/// Request id and access logging middleware for actix-web
///
/// Assigns the [`RequestContext`] before any handler runs, logs one line per
/// request with its status and duration, and echoes `X-Request-Id`.
pub struct LoggingMiddleware;

impl<S, B> Transform<S, ServiceRequest> for LoggingMiddleware
where
	S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
	S::Future: 'static,
	B: 'static,
{
	type Response = ServiceResponse<B>;
	type Error = Error;
	type InitError = ();
	type Transform = LoggingMiddlewareInner<S>;
	type Future = Ready<Result<Self::Transform, Self::InitError>>;

	fn new_transform(&self, service: S) -> Self::Future {
		ready(Ok(LoggingMiddlewareInner {
			service: Rc::new(service),
		}))
	}
}

pub struct LoggingMiddlewareInner<S> {
	service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for LoggingMiddlewareInner<S>
where
	S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
	S::Future: 'static,
	B: 'static,
{
	type Response = ServiceResponse<B>;
	type Error = Error;
	type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>>>>;

	fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		self.service.poll_ready(cx)
	}

	fn call(&self, mut req: ServiceRequest) -> Self::Future {
		let service = self.service.clone();
		let ctx = RequestContext::ensure(&mut req);
		let method = req.method().clone();
		let path = req.path().to_string();
		let span = tracing::info_span!(
			"http_request",
			method = %method,
			path = %path,
			request_id = %ctx.request_id
		);

		Box::pin(
			async move {
				let start = std::time::Instant::now();
				let res = service.call(req).await;
				let duration = start.elapsed();

				match res {
					Ok(mut response) => {
						ctx.write_response_headers(&mut response);
						info!(
							target: "gateway::http",
							status = response.status().as_u16(),
							duration_ms = duration.as_millis(),
							"Request completed"
						);
						Ok(response)
					}
					Err(e) => {
						warn!(
							target: "gateway::http",
							error = %e,
							duration_ms = duration.as_millis(),
							"Request failed"
						);
						Err(e)
					}
				}
			}
			.instrument(span),
		)
	}
}
