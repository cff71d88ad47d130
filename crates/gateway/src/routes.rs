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

use actix_web::{guard, web};
use tracing::{debug, warn};

use crate::{config::RouteSpec, handlers};

/// Configure API routes for the gateway
///
/// - `/health` - Health check, outside the pipeline
/// - one resource per configured route, guarded by its method
///
/// Resources sharing a path fall through to each other on a method
/// mismatch, and finally to the app's default service.
pub fn configure_routes(cfg: &mut web::ServiceConfig, routes: &[RouteSpec]) {
	cfg.route("/health", web::get().to(handlers::health));

	for route in routes {
		let method = match route.http_method() {
			Ok(method) => method,
			Err(e) => {
				warn!(target: "gateway::routes", route = %route.name, error = %e, "Skipping route");
				continue;
			}
		};
		debug!(target: "gateway::routes", route = %route.name, method = %method, path = %route.path, "Route registered");
		cfg.service(
			web::resource(route.path.as_str())
				.name(&route.name)
				.guard(guard::Method(method))
				.app_data(web::Data::new(route.clone()))
				.to(handlers::dispatch),
		);
	}
}
