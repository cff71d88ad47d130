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

//! Request admission pipeline
//!
//! Stages run in a fixed order and the first one that refuses a request ends
//! it:
//!
//! 1. [`ClientAuthenticator`] (skipped on public routes)
//! 2. [`TenantResolver`], resolve then authorize the restaurant
//! 3. scope check against the route requirement
//! 4. idempotency key syntax
//! 5. [`RateLimiter`]
//! 6. [`IdempotencyGuard`], which may answer from a recorded response
//! 7. the downstream [`RequestHandler`]
//!
//! Nothing is held across the handler call: admission and the idempotency
//! claim complete before it runs, recording happens after it returns.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tavola_store::CounterStore;
use tracing::{debug, warn};

use crate::{
	auth::ClientAuthenticator,
	config::{GatewayConfig, RouteSpec},
	directory::Directory,
	dispatcher::{DispatchRequest, HEADER_REQUEST_ID, RequestHandler},
	error::GatewayError,
	idempotency::{self, Admission, IdempotencyGuard, RecordOwner},
	identity::caller_key,
	rate_limit::{RateLimitStatus, RateLimiter},
	request::{GatewayRequest, GatewayResponse},
	scope,
	tenant::{DeviceCache, TenantResolver},
};

pub struct Pipeline {
	authenticator: ClientAuthenticator,
	tenants: TenantResolver,
	rate_limiter: RateLimiter,
	idempotency: IdempotencyGuard,
	handler: Arc<dyn RequestHandler>,
	trust_forwarded_for: bool,
}

impl Pipeline {
	pub fn new(
		config: &GatewayConfig,
		store: Arc<dyn CounterStore>,
		directory: Arc<dyn Directory>,
		handler: Arc<dyn RequestHandler>,
	) -> Self {
		Self {
			authenticator: ClientAuthenticator::new(directory.clone()),
			tenants: TenantResolver::new(directory),
			rate_limiter: RateLimiter::new(store.clone(), config.rate_limit.clone()),
			idempotency: IdempotencyGuard::new(store, &config.idempotency),
			handler,
			trust_forwarded_for: config.server.trust_forwarded_for,
		}
	}

	pub async fn process(&self, route: &RouteSpec, request: &GatewayRequest) -> GatewayResponse {
		self.process_at(route, request, Utc::now()).await
	}

	/// Run `request` through every stage as of `now`.
	///
	/// Always produces a response; stage errors are rendered into the JSON
	/// error envelope.
	pub async fn process_at(
		&self,
		route: &RouteSpec,
		request: &GatewayRequest,
		now: DateTime<Utc>,
	) -> GatewayResponse {
		let mut quota = None;
		let mut response = match self.admit_and_dispatch(route, request, now, &mut quota).await {
			Ok(response) => response,
			Err(e) => {
				if e.status().is_server_error() {
					warn!(target: "gateway::pipeline", route = %route.name, request_id = %request.request_id, code = e.code(), error = %e, "Request failed");
				} else {
					debug!(target: "gateway::pipeline", route = %route.name, request_id = %request.request_id, code = e.code(), "Request refused");
				}
				e.to_response()
			}
		};

		if let Some(quota) = quota {
			quota.apply(&mut response);
		}
		response.set_header(HEADER_REQUEST_ID, &request.request_id);
		response
	}

	async fn admit_and_dispatch(
		&self,
		route: &RouteSpec,
		request: &GatewayRequest,
		now: DateTime<Utc>,
		quota: &mut Option<RateLimitStatus>,
	) -> Result<GatewayResponse, GatewayError> {
		let caller_ip = request.client_ip(self.trust_forwarded_for);

		let identity = if route.public {
			None
		} else {
			Some(
				self.authenticator
					.authenticate(&request.headers, caller_ip, now)
					.await?,
			)
		};

		let mut devices = DeviceCache::default();
		let tenant = self
			.tenants
			.resolve_and_authorize(request, route, identity.as_ref(), &mut devices)
			.await?;

		if let Some(identity) = &identity {
			scope::authorize(&identity.scopes, &route.scopes)?;
		}

		let idempotency_key = idempotency::key_from(request)?;

		let caller = caller_key(identity.as_ref(), caller_ip);
		*quota = Some(
			self.rate_limiter
				.check_at(&caller, identity.as_ref(), request.is_mutating(), now)
				.await?,
		);

		let ticket = match idempotency_key {
			Some(key) => {
				let owner = RecordOwner::of(identity.as_ref(), caller_ip);
				match self.idempotency.begin(&owner, &key, request).await? {
					Admission::Replay(response) => return Ok(response),
					Admission::Proceed(ticket) => Some(ticket),
				}
			}
			None => None,
		};

		let dispatch = DispatchRequest {
			request,
			route,
			identity: identity.as_ref(),
			tenant: tenant.as_ref(),
		};
		let response = match self.handler.handle(dispatch).await {
			Ok(response) => response,
			Err(e) => GatewayError::from(e).to_response(),
		};

		if let Some(ticket) = ticket {
			self.idempotency.complete_at(ticket, &response, now).await;
		}
		Ok(response)
	}
}
