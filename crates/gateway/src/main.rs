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

//! Tavola Gateway Service
//!
//! Usage: `tavola-gateway [config.toml]`. Without an argument the config path
//! comes from `GATEWAY_CONFIG`, then `config/gateway.toml`.

use anyhow::{Context, Result};
use tavola_gateway::{config::GatewayConfig, logging::init_logging, server::GatewayServer};
use tracing::info;

#[actix_rt::main]
async fn main() -> Result<()> {
	// Initialize logging first
	init_logging()?;

	let config_path = std::env::args().nth(1);
	let config =
		GatewayConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
	info!(
		target: "gateway::server",
		bind_addr = %config.server.bind_addr,
		routes = config.routes.len(),
		"Configuration loaded"
	);

	let server = GatewayServer::new(config).context("Failed to create gateway server")?;

	info!(target: "gateway::server", "Gateway server initialized");

	server.serve().await
}
