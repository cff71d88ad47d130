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

use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use anyhow::{Context, Result};
use tavola_store::{CounterStore, MemoryStore, RedisStore};
use tracing::{info, warn};

use crate::{
	config::GatewayConfig,
	directory::{Directory, MemoryDirectory},
	dispatcher::{HttpForwarder, RequestHandler},
	handlers,
	middleware::LoggingMiddleware,
	pipeline::Pipeline,
	routes,
};

/// Gateway server state shared by all workers
pub struct GatewayState {
	pub pipeline: Pipeline,
}

/// Gateway server
pub struct GatewayServer {
	config: GatewayConfig,
	state: web::Data<GatewayState>,
}

impl GatewayServer {
	/// Build the production stack from configuration.
	///
	/// Without `store.redis_url` the counters live in process memory, which is
	/// only correct for a single gateway instance.
	pub fn new(config: GatewayConfig) -> Result<Self> {
		let store: Arc<dyn CounterStore> = match &config.store.redis_url {
			Some(url) => {
				info!(target: "gateway::server", timeout_ms = config.store.timeout_ms, "Using Redis counter store");
				Arc::new(
					RedisStore::connect(url, config.store.timeout())
						.context("Invalid store.redis_url")?,
				)
			}
			None => {
				warn!(target: "gateway::server", "store.redis_url not set, counters are process-local");
				Arc::new(MemoryStore::new())
			}
		};

		let directory = MemoryDirectory::load(&config.directory.seed_path).with_context(|| {
			format!(
				"Failed to load directory seed {}",
				config.directory.seed_path
			)
		})?;
		let handler =
			HttpForwarder::new(&config.backend).context("Failed to build backend client")?;

		Ok(Self::with_parts(
			config,
			store,
			Arc::new(directory),
			Arc::new(handler),
		))
	}

	/// Assemble a server from explicit collaborators.
	pub fn with_parts(
		config: GatewayConfig,
		store: Arc<dyn CounterStore>,
		directory: Arc<dyn Directory>,
		handler: Arc<dyn RequestHandler>,
	) -> Self {
		let pipeline = Pipeline::new(&config, store, directory, handler);
		Self {
			config,
			state: web::Data::new(GatewayState { pipeline }),
		}
	}

	pub fn state(&self) -> web::Data<GatewayState> {
		self.state.clone()
	}

	/// Start the HTTP server
	pub async fn serve(self) -> Result<()> {
		let bind_addr = self.config.server.bind_addr.clone();
		let workers = self.config.workers();
		let max_body_bytes = self.config.server.max_body_bytes;
		let route_table = Arc::new(self.config.routes);
		let state = self.state;

		info!(
			target: "gateway::server",
			bind_addr = %bind_addr,
			workers,
			routes = route_table.len(),
			"Starting gateway"
		);

		HttpServer::new(move || {
			let route_table = route_table.clone();
			App::new()
				.app_data(state.clone())
				.app_data(web::PayloadConfig::new(max_body_bytes))
				.wrap(LoggingMiddleware)
				.configure(move |cfg| routes::configure_routes(cfg, &route_table))
				.default_service(web::to(handlers::not_found))
		})
		.workers(workers)
		.bind(&bind_addr)
		.with_context(|| format!("Failed to bind {bind_addr}"))?
		.run()
		.await
		.context("Gateway server terminated with an error")?;

		Ok(())
	}
}
