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

//! Tenant resolution and isolation
//!
//! Every request is bound to at most one restaurant. The restaurant is taken
//! from the first source that yields one, in this order:
//!
//! 1. An entity bound by the route (table, order, zone, ...), looked up by the
//!    path parameter the route declares for it.
//! 2. The caller's own restaurant, unless the caller is a superadmin.
//! 3. An active kitchen display named by `X-Device-ID` or a `device_id` body
//!    field.
//! 4. An explicit `restaurant_id` query parameter or `X-Restaurant-ID` header,
//!    honoured for superadmins only.
//!
//! After resolution the caller is authorized against the restaurant. An
//! authenticated caller other than a superadmin that ends up with no
//! restaurant at all is refused.

use std::{collections::HashMap, sync::Arc};

use actix_web::http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
	config::RouteSpec,
	directory::{DeviceRecord, Directory, DirectoryError},
	identity::{Identity, Role},
	request::GatewayRequest,
};

pub const HEADER_DEVICE_ID: &str = "X-Device-ID";
pub const HEADER_RESTAURANT_ID: &str = "X-Restaurant-ID";
pub const QUERY_RESTAURANT_ID: &str = "restaurant_id";
pub const BODY_DEVICE_ID: &str = "device_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedFrom {
	RouteModel,
	User,
	Device,
	ExplicitParam,
}

impl ResolvedFrom {
	pub fn as_str(&self) -> &'static str {
		match self {
			ResolvedFrom::RouteModel => "route_model",
			ResolvedFrom::User => "user",
			ResolvedFrom::Device => "device",
			ResolvedFrom::ExplicitParam => "explicit_param",
		}
	}
}

/// Sources in the order they are consulted
pub const RESOLUTION_ORDER: [ResolvedFrom; 4] = [
	ResolvedFrom::RouteModel,
	ResolvedFrom::User,
	ResolvedFrom::Device,
	ResolvedFrom::ExplicitParam,
];

/// Restaurant a request is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantContext {
	pub restaurant_id: String,
	pub resolved_from: ResolvedFrom,
}

#[derive(Debug, Error)]
pub enum TenantError {
	#[error("No restaurant context could be determined for this request")]
	MissingContext,
	#[error("Access to this restaurant is not allowed")]
	CrossTenant { restaurant_id: String },
	#[error(transparent)]
	Directory(#[from] DirectoryError),
}

impl TenantError {
	pub fn code(&self) -> &'static str {
		match self {
			TenantError::Directory(_) => "SERVICE_UNAVAILABLE",
			_ => "FORBIDDEN",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			TenantError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
			_ => StatusCode::FORBIDDEN,
		}
	}
}

/// Device lookups made while handling one request
///
/// Misses are cached as well, so a device id is looked up at most once.
#[derive(Debug, Default)]
pub struct DeviceCache {
	entries: HashMap<String, Option<DeviceRecord>>,
}

impl DeviceCache {
	async fn lookup(
		&mut self,
		directory: &dyn Directory,
		device_id: &str,
	) -> Result<Option<DeviceRecord>, DirectoryError> {
		if let Some(hit) = self.entries.get(device_id) {
			return Ok(hit.clone());
		}
		let record = directory.find_device_unscoped(device_id).await?;
		self.entries.insert(device_id.to_string(), record.clone());
		Ok(record)
	}
}

pub struct TenantResolver {
	directory: Arc<dyn Directory>,
}

impl TenantResolver {
	pub fn new(directory: Arc<dyn Directory>) -> Self {
		Self { directory }
	}

	/// Resolve, then authorize, the restaurant of a request.
	///
	/// Returns `Ok(None)` only for anonymous callers and superadmins that no
	/// source bound to a restaurant.
	pub async fn resolve_and_authorize(
		&self,
		request: &GatewayRequest,
		route: &RouteSpec,
		identity: Option<&Identity>,
		devices: &mut DeviceCache,
	) -> Result<Option<TenantContext>, TenantError> {
		match self.resolve(request, route, identity, devices).await? {
			Some(context) => {
				self.authorize(identity, &context.restaurant_id).await?;
				Ok(Some(context))
			}
			None => match identity {
				Some(identity) if !identity.is_superadmin() => {
					warn!(
						target: "gateway::tenant",
						subject = %identity.subject(),
						route = %route.name,
						"Authenticated caller without restaurant context"
					);
					Err(TenantError::MissingContext)
				}
				_ => Ok(None),
			},
		}
	}

	/// Walk [`RESOLUTION_ORDER`] and return the first restaurant found.
	pub async fn resolve(
		&self,
		request: &GatewayRequest,
		route: &RouteSpec,
		identity: Option<&Identity>,
		devices: &mut DeviceCache,
	) -> Result<Option<TenantContext>, TenantError> {
		for source in RESOLUTION_ORDER {
			let found = match source {
				ResolvedFrom::RouteModel => self.from_route_model(request, route).await?,
				ResolvedFrom::User => from_user(identity),
				ResolvedFrom::Device => self.from_device(request, devices).await?,
				ResolvedFrom::ExplicitParam => from_explicit_param(request, identity),
			};
			if let Some(restaurant_id) = found {
				debug!(
					target: "gateway::tenant",
					restaurant_id = %restaurant_id,
					source = source.as_str(),
					"Restaurant resolved"
				);
				return Ok(Some(TenantContext {
					restaurant_id,
					resolved_from: source,
				}));
			}
		}
		Ok(None)
	}

	/// Check that `identity` may act on `restaurant_id`.
	pub async fn authorize(
		&self,
		identity: Option<&Identity>,
		restaurant_id: &str,
	) -> Result<(), TenantError> {
		// Public and device endpoints carry no identity.
		let Some(identity) = identity else {
			return Ok(());
		};

		let allowed = match identity.role {
			Role::Superadmin => true,
			Role::TenantOwner => {
				let restaurant = self
					.directory
					.find_restaurant_unscoped(restaurant_id)
					.await?;
				matches!(
					(restaurant, &identity.tenant_id),
					(Some(r), Some(tenant)) if &r.tenant_id == tenant
				)
			}
			Role::Staff => identity.restaurant_id.as_deref() == Some(restaurant_id),
		};

		if allowed {
			Ok(())
		} else {
			warn!(
				target: "gateway::tenant",
				subject = %identity.subject(),
				restaurant_id = %restaurant_id,
				"Cross-restaurant access refused"
			);
			Err(TenantError::CrossTenant {
				restaurant_id: restaurant_id.to_string(),
			})
		}
	}

	async fn from_route_model(
		&self,
		request: &GatewayRequest,
		route: &RouteSpec,
	) -> Result<Option<String>, DirectoryError> {
		for binding in &route.bindings {
			let Some(entity_id) = request.path_params.get(&binding.param) else {
				continue;
			};
			if let Some(restaurant_id) = self
				.directory
				.restaurant_of(&binding.entity, entity_id)
				.await?
			{
				return Ok(Some(restaurant_id));
			}
		}
		Ok(None)
	}

	async fn from_device(
		&self,
		request: &GatewayRequest,
		devices: &mut DeviceCache,
	) -> Result<Option<String>, DirectoryError> {
		let Some(device_id) = device_id(request) else {
			return Ok(None);
		};
		let device = devices.lookup(self.directory.as_ref(), &device_id).await?;
		Ok(device
			.filter(|d| d.active)
			.map(|d| d.restaurant_id))
	}
}

fn from_user(identity: Option<&Identity>) -> Option<String> {
	identity
		.filter(|i| !i.is_superadmin())
		.and_then(|i| i.restaurant_id.clone())
}

fn from_explicit_param(request: &GatewayRequest, identity: Option<&Identity>) -> Option<String> {
	if !identity.is_some_and(Identity::is_superadmin) {
		return None;
	}
	request
		.query_param(QUERY_RESTAURANT_ID)
		.or_else(|| request.header(HEADER_RESTAURANT_ID).map(str::to_string))
		.filter(|id| !id.is_empty())
}

fn device_id(request: &GatewayRequest) -> Option<String> {
	if let Some(id) = request.header(HEADER_DEVICE_ID).filter(|id| !id.is_empty()) {
		return Some(id.to_string());
	}
	if request.body.is_empty() {
		return None;
	}
	serde_json::from_slice::<Value>(&request.body)
		.ok()?
		.get(BODY_DEVICE_ID)?
		.as_str()
		.filter(|id| !id.is_empty())
		.map(str::to_string)
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use actix_web::http::Method;

	use super::*;
	use crate::{
		config::RouteBinding,
		directory::{EntityRecord, MemoryDirectory, RestaurantRecord},
		identity::{AuthMethod, SubjectType},
	};

	fn identity(role: Role, tenant: &str, restaurant: Option<&str>) -> Identity {
		Identity {
			subject_type: SubjectType::User,
			client_id: None,
			user_id: Some("u-1".to_string()),
			tenant_id: Some(tenant.to_string()),
			restaurant_id: restaurant.map(str::to_string),
			role,
			scopes: BTreeSet::new(),
			auth_method: AuthMethod::Bearer,
			plan: None,
			custom_limits: None,
			utc_offset_minutes: None,
		}
	}

	fn superadmin() -> Identity {
		let mut admin = identity(Role::Superadmin, "", None);
		admin.tenant_id = None;
		admin
	}

	fn route(bindings: &[(&str, &str)]) -> RouteSpec {
		RouteSpec {
			name: "test".to_string(),
			method: "GET".to_string(),
			path: "/api/v1/tables/{table_id}".to_string(),
			scopes: vec![],
			bindings: bindings
				.iter()
				.map(|(param, entity)| RouteBinding {
					param: param.to_string(),
					entity: entity.to_string(),
				})
				.collect(),
			public: false,
		}
	}

	fn directory() -> Arc<MemoryDirectory> {
		let directory = MemoryDirectory::new();
		for (id, tenant) in [("r-1", "t-1"), ("r-2", "t-1"), ("r-9", "t-9")] {
			directory.insert_restaurant(RestaurantRecord {
				id: id.to_string(),
				tenant_id: tenant.to_string(),
				name: String::new(),
			});
		}
		directory.insert_entity(EntityRecord {
			kind: "table".to_string(),
			id: "12".to_string(),
			restaurant_id: "r-2".to_string(),
		});
		directory.insert_device(DeviceRecord {
			device_id: "kds-1".to_string(),
			restaurant_id: "r-1".to_string(),
			active: true,
		});
		directory.insert_device(DeviceRecord {
			device_id: "kds-off".to_string(),
			restaurant_id: "r-1".to_string(),
			active: false,
		});
		Arc::new(directory)
	}

	#[tokio::test]
	async fn route_binding_wins_over_user() {
		let resolver = TenantResolver::new(directory());
		let req = GatewayRequest::new(Method::GET, "/api/v1/tables/12").with_path_param("table_id", "12");
		let staff = identity(Role::Staff, "t-1", Some("r-1"));

		let ctx = resolver
			.resolve(&req, &route(&[("table_id", "table")]), Some(&staff), &mut DeviceCache::default())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(ctx.restaurant_id, "r-2");
		assert_eq!(ctx.resolved_from, ResolvedFrom::RouteModel);

		// The bound table belongs to another restaurant than the staff member's.
		let err = resolver
			.resolve_and_authorize(
				&req,
				&route(&[("table_id", "table")]),
				Some(&staff),
				&mut DeviceCache::default(),
			)
			.await
			.unwrap_err();
		assert!(matches!(err, TenantError::CrossTenant { .. }));
	}

	#[tokio::test]
	async fn unknown_bound_entity_falls_through() {
		let resolver = TenantResolver::new(directory());
		let req = GatewayRequest::new(Method::GET, "/api/v1/tables/99").with_path_param("table_id", "99");
		let staff = identity(Role::Staff, "t-1", Some("r-1"));

		let ctx = resolver
			.resolve(&req, &route(&[("table_id", "table")]), Some(&staff), &mut DeviceCache::default())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(ctx.resolved_from, ResolvedFrom::User);
	}

	#[tokio::test]
	async fn device_from_header_or_body() {
		let resolver = TenantResolver::new(directory());
		let by_header = GatewayRequest::new(Method::POST, "/kds/ack").with_header(HEADER_DEVICE_ID, "kds-1");
		let by_body = GatewayRequest::new(Method::POST, "/kds/ack").with_body(r#"{"device_id":"kds-1"}"#);
		let inactive = GatewayRequest::new(Method::POST, "/kds/ack").with_header(HEADER_DEVICE_ID, "kds-off");

		for req in [by_header, by_body] {
			let ctx = resolver
				.resolve(&req, &route(&[]), None, &mut DeviceCache::default())
				.await
				.unwrap()
				.unwrap();
			assert_eq!(ctx.restaurant_id, "r-1");
			assert_eq!(ctx.resolved_from, ResolvedFrom::Device);
		}
		assert!(resolver
			.resolve(&inactive, &route(&[]), None, &mut DeviceCache::default())
			.await
			.unwrap()
			.is_none());
	}

	#[tokio::test]
	async fn explicit_param_only_for_superadmin() {
		let resolver = TenantResolver::new(directory());
		let req = GatewayRequest::new(Method::GET, "/reports").with_query("restaurant_id=r-9");

		let ctx = resolver
			.resolve_and_authorize(&req, &route(&[]), Some(&superadmin()), &mut DeviceCache::default())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(ctx.restaurant_id, "r-9");
		assert_eq!(ctx.resolved_from, ResolvedFrom::ExplicitParam);

		// A tenant owner cannot reach another restaurant through the parameter.
		let owner = identity(Role::TenantOwner, "t-1", None);
		let err = resolver
			.resolve_and_authorize(&req, &route(&[]), Some(&owner), &mut DeviceCache::default())
			.await
			.unwrap_err();
		assert!(matches!(err, TenantError::MissingContext));

		let header = GatewayRequest::new(Method::GET, "/reports").with_header(HEADER_RESTAURANT_ID, "r-9");
		let ctx = resolver
			.resolve(&header, &route(&[]), Some(&superadmin()), &mut DeviceCache::default())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(ctx.restaurant_id, "r-9");
	}

	#[tokio::test]
	async fn superadmin_without_restaurant_passes() {
		let resolver = TenantResolver::new(directory());
		let req = GatewayRequest::new(Method::GET, "/admin/tenants");
		let ctx = resolver
			.resolve_and_authorize(&req, &route(&[]), Some(&superadmin()), &mut DeviceCache::default())
			.await
			.unwrap();
		assert!(ctx.is_none());
	}

	#[tokio::test]
	async fn tenant_owner_limited_to_own_tenant() {
		let resolver = TenantResolver::new(directory());
		let owner = identity(Role::TenantOwner, "t-1", None);
		assert!(resolver.authorize(Some(&owner), "r-2").await.is_ok());
		assert!(resolver.authorize(Some(&owner), "r-9").await.is_err());
		assert!(resolver.authorize(Some(&owner), "r-missing").await.is_err());
	}

	#[tokio::test]
	async fn anonymous_callers_pass_authorization() {
		let resolver = TenantResolver::new(directory());
		assert!(resolver.authorize(None, "r-9").await.is_ok());
	}

	#[tokio::test]
	async fn device_lookup_cached_per_request() {
		let directory = directory();
		let mut cache = DeviceCache::default();
		assert!(cache.lookup(directory.as_ref(), "kds-1").await.unwrap().is_some());

		// Removing the record does not affect the cached answer.
		let empty = MemoryDirectory::new();
		assert!(cache.lookup(&empty, "kds-1").await.unwrap().is_some());
		assert!(cache.lookup(&empty, "kds-2").await.unwrap().is_none());
	}
}
