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

use actix_web::{HttpRequest, HttpResponse, Responder, web};

use crate::{
	config::RouteSpec, error::GatewayError, request::GatewayRequest,
	request_context::RequestContext, server::GatewayState,
};

/// Health check endpoint
pub async fn health() -> impl Responder {
	HttpResponse::Ok().json(serde_json::json!({
		"status": "ok",
		"service": "tavola-gateway"
	}))
}

/// Run a request matched by a configured route through the pipeline
///
/// The matched [`RouteSpec`] is attached to its actix resource as app data.
pub async fn dispatch(
	state: web::Data<GatewayState>,
	route: web::Data<RouteSpec>,
	req: HttpRequest,
	body: web::Bytes,
) -> HttpResponse {
	let request_id = RequestContext::request_id_of(&req);
	let request = GatewayRequest::from_http(&req, body, request_id);
	state
		.pipeline
		.process(route.get_ref(), &request)
		.await
		.into_http()
}

/// Fallback for requests no route matched
pub async fn not_found(req: HttpRequest) -> Result<HttpResponse, GatewayError> {
	Err(GatewayError::NotFound {
		method: req.method().to_string(),
		path: req.path().to_string(),
	})
}
