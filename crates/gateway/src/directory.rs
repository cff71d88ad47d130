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

//! Read access to business-owned records
//!
//! API clients, users, access tokens, kitchen devices and restaurants are owned
//! by the business layer. The gateway only reads them (plus "last used"
//! bookkeeping) through the [`Directory`] trait.
//!
//! Lookups suffixed `_unscoped` deliberately ignore tenant scoping: they are
//! the lookups that establish which tenant a request belongs to.

use std::{net::IpAddr, path::Path};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{config::RateLimits, identity::Role};

#[derive(Debug, Error)]
pub enum DirectoryError {
	#[error("directory unavailable: {0}")]
	Unavailable(String),
	#[error("invalid directory seed: {0}")]
	Seed(String),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

fn default_true() -> bool {
	true
}

/// Machine-to-machine API client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiClientRecord {
	pub id: String,
	#[serde(default)]
	pub name: String,
	pub api_key: String,
	/// Lower-case hex SHA-256 of the client secret
	pub secret_sha256: String,
	pub tenant_id: String,
	#[serde(default)]
	pub restaurant_id: Option<String>,
	#[serde(default)]
	pub scopes: Vec<String>,
	#[serde(default = "default_true")]
	pub active: bool,
	/// CIDR networks or bare addresses; empty allows any address
	#[serde(default)]
	pub allowed_ips: Vec<String>,
	#[serde(default)]
	pub plan: Option<String>,
	#[serde(default)]
	pub custom_limits: Option<RateLimits>,
	#[serde(default)]
	pub utc_offset_minutes: Option<i32>,
	#[serde(default)]
	pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiClientRecord {
	/// Whether `ip` falls inside the allow-list.
	///
	/// Entries that parse neither as a network nor as an address never match.
	/// An unknown caller address only passes an empty allow-list.
	pub fn allows_ip(&self, ip: Option<IpAddr>) -> bool {
		if self.allowed_ips.is_empty() {
			return true;
		}
		let Some(ip) = ip else {
			return false;
		};
		self.allowed_ips.iter().any(|entry| match parse_network(entry) {
			Some(net) => net.contains(&ip),
			None => {
				warn!(
					target: "gateway::directory",
					client_id = %self.id,
					entry = %entry,
					"Ignoring malformed allow-list entry"
				);
				false
			}
		})
	}
}

fn parse_network(entry: &str) -> Option<IpNet> {
	let entry = entry.trim();
	if let Ok(net) = entry.parse::<IpNet>() {
		return Some(net);
	}
	let addr = entry.parse::<IpAddr>().ok()?;
	let prefix = match addr {
		IpAddr::V4(_) => 32,
		IpAddr::V6(_) => 128,
	};
	IpNet::new(addr, prefix).ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
	pub id: String,
	#[serde(default)]
	pub tenant_id: Option<String>,
	#[serde(default)]
	pub restaurant_id: Option<String>,
	pub role: Role,
	#[serde(default = "default_true")]
	pub active: bool,
}

/// Opaque bearer token, stored by digest only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenRecord {
	pub id: String,
	/// Lower-case hex SHA-256 of the bearer string
	pub token_sha256: String,
	pub user_id: String,
	#[serde(default)]
	pub client_id: Option<String>,
	pub token_type: String,
	#[serde(default)]
	pub abilities: Vec<String>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub last_used_at: Option<DateTime<Utc>>,
}

/// Registered kitchen display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
	pub device_id: String,
	pub restaurant_id: String,
	#[serde(default = "default_true")]
	pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestaurantRecord {
	pub id: String,
	pub tenant_id: String,
	#[serde(default)]
	pub name: String,
}

/// A restaurant-owned entity that routes can bind, such as a table or an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
	pub kind: String,
	pub id: String,
	pub restaurant_id: String,
}

#[async_trait]
pub trait Directory: Send + Sync {
	async fn find_client_by_key(&self, api_key: &str) -> DirectoryResult<Option<ApiClientRecord>>;

	async fn find_client(&self, id: &str) -> DirectoryResult<Option<ApiClientRecord>>;

	/// Look up a token by the SHA-256 hex digest of its bearer string.
	async fn find_token(&self, token_sha256: &str) -> DirectoryResult<Option<AccessTokenRecord>>;

	async fn find_user(&self, id: &str) -> DirectoryResult<Option<UserRecord>>;

	async fn find_device_unscoped(&self, device_id: &str) -> DirectoryResult<Option<DeviceRecord>>;

	async fn find_restaurant_unscoped(&self, id: &str)
	-> DirectoryResult<Option<RestaurantRecord>>;

	/// Restaurant owning the entity `kind`/`id`, if it exists.
	async fn restaurant_of(&self, kind: &str, id: &str) -> DirectoryResult<Option<String>>;

	async fn touch_client(&self, id: &str, at: DateTime<Utc>) -> DirectoryResult<()>;

	async fn touch_token(&self, id: &str, at: DateTime<Utc>) -> DirectoryResult<()>;
}

/// Seed document for [`MemoryDirectory`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySeed {
	pub clients: Vec<ApiClientRecord>,
	pub users: Vec<UserRecord>,
	pub tokens: Vec<AccessTokenRecord>,
	pub devices: Vec<DeviceRecord>,
	pub restaurants: Vec<RestaurantRecord>,
	pub entities: Vec<EntityRecord>,
}

/// In-memory [`Directory`] seeded from JSON
#[derive(Default)]
pub struct MemoryDirectory {
	clients: DashMap<String, ApiClientRecord>,
	/// api_key -> client id
	client_keys: DashMap<String, String>,
	/// token_sha256 -> token
	tokens: DashMap<String, AccessTokenRecord>,
	users: DashMap<String, UserRecord>,
	devices: DashMap<String, DeviceRecord>,
	restaurants: DashMap<String, RestaurantRecord>,
	entities: DashMap<(String, String), String>,
}

impl MemoryDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_seed(seed: DirectorySeed) -> Self {
		let directory = Self::new();
		seed.clients
			.into_iter()
			.for_each(|c| directory.insert_client(c));
		seed.users.into_iter().for_each(|u| directory.insert_user(u));
		seed.tokens.into_iter().for_each(|t| directory.insert_token(t));
		seed.devices
			.into_iter()
			.for_each(|d| directory.insert_device(d));
		seed.restaurants
			.into_iter()
			.for_each(|r| directory.insert_restaurant(r));
		seed.entities
			.into_iter()
			.for_each(|e| directory.insert_entity(e));
		directory
	}

	/// Load a JSON seed file.
	pub fn load(path: impl AsRef<Path>) -> DirectoryResult<Self> {
		let path = path.as_ref();
		let raw = std::fs::read_to_string(path)
			.map_err(|e| DirectoryError::Seed(format!("{}: {}", path.display(), e)))?;
		let seed: DirectorySeed = serde_json::from_str(&raw)
			.map_err(|e| DirectoryError::Seed(format!("{}: {}", path.display(), e)))?;

		info!(
			target: "gateway::directory",
			clients = seed.clients.len(),
			users = seed.users.len(),
			tokens = seed.tokens.len(),
			devices = seed.devices.len(),
			restaurants = seed.restaurants.len(),
			"Directory seed loaded from {}",
			path.display()
		);
		Ok(Self::from_seed(seed))
	}

	pub fn insert_client(&self, client: ApiClientRecord) {
		self.client_keys
			.insert(client.api_key.clone(), client.id.clone());
		self.clients.insert(client.id.clone(), client);
	}

	pub fn insert_user(&self, user: UserRecord) {
		self.users.insert(user.id.clone(), user);
	}

	pub fn insert_token(&self, token: AccessTokenRecord) {
		self.tokens
			.insert(token.token_sha256.to_ascii_lowercase(), token);
	}

	pub fn insert_device(&self, device: DeviceRecord) {
		self.devices.insert(device.device_id.clone(), device);
	}

	pub fn insert_restaurant(&self, restaurant: RestaurantRecord) {
		self.restaurants.insert(restaurant.id.clone(), restaurant);
	}

	pub fn insert_entity(&self, entity: EntityRecord) {
		self.entities
			.insert((entity.kind, entity.id), entity.restaurant_id);
	}
}

#[async_trait]
impl Directory for MemoryDirectory {
	async fn find_client_by_key(&self, api_key: &str) -> DirectoryResult<Option<ApiClientRecord>> {
		let Some(id) = self.client_keys.get(api_key).map(|id| id.clone()) else {
			return Ok(None);
		};
		Ok(self.clients.get(&id).map(|c| c.clone()))
	}

	async fn find_client(&self, id: &str) -> DirectoryResult<Option<ApiClientRecord>> {
		Ok(self.clients.get(id).map(|c| c.clone()))
	}

	async fn find_token(&self, token_sha256: &str) -> DirectoryResult<Option<AccessTokenRecord>> {
		Ok(self.tokens.get(token_sha256).map(|t| t.clone()))
	}

	async fn find_user(&self, id: &str) -> DirectoryResult<Option<UserRecord>> {
		Ok(self.users.get(id).map(|u| u.clone()))
	}

	async fn find_device_unscoped(&self, device_id: &str) -> DirectoryResult<Option<DeviceRecord>> {
		Ok(self.devices.get(device_id).map(|d| d.clone()))
	}

	async fn find_restaurant_unscoped(
		&self,
		id: &str,
	) -> DirectoryResult<Option<RestaurantRecord>> {
		Ok(self.restaurants.get(id).map(|r| r.clone()))
	}

	async fn restaurant_of(&self, kind: &str, id: &str) -> DirectoryResult<Option<String>> {
		Ok(self
			.entities
			.get(&(kind.to_string(), id.to_string()))
			.map(|r| r.clone()))
	}

	async fn touch_client(&self, id: &str, at: DateTime<Utc>) -> DirectoryResult<()> {
		if let Some(mut client) = self.clients.get_mut(id) {
			client.last_used_at = Some(at);
		}
		Ok(())
	}

	async fn touch_token(&self, id: &str, at: DateTime<Utc>) -> DirectoryResult<()> {
		if let Some(mut token) = self.tokens.iter_mut().find(|t| t.id == id) {
			token.last_used_at = Some(at);
		}
		Ok(())
	}
}
