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

use std::{collections::BTreeSet, net::IpAddr};

use serde::{Deserialize, Serialize};

use crate::config::RateLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
	Client,
	User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
	ApiKey,
	Bearer,
}

/// Tenant-isolation role of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	/// No restaurant binding; bypasses tenant isolation
	Superadmin,
	/// May act on every restaurant of its tenant
	TenantOwner,
	/// Bound to exactly one restaurant
	Staff,
}

/// Authenticated subject of one request
///
/// Built by the authenticator and dropped with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub subject_type: SubjectType,
	pub client_id: Option<String>,
	pub user_id: Option<String>,
	pub tenant_id: Option<String>,
	pub restaurant_id: Option<String>,
	pub role: Role,
	pub scopes: BTreeSet<String>,
	pub auth_method: AuthMethod,
	/// Named rate plan of the client, if any
	pub plan: Option<String>,
	/// Per-client override; wins over `plan`
	pub custom_limits: Option<RateLimits>,
	/// Offset for the daily quota reset
	pub utc_offset_minutes: Option<i32>,
}

impl Identity {
	pub fn is_superadmin(&self) -> bool {
		self.role == Role::Superadmin
	}

	/// `client:<id>` or `user:<id>`, forwarded downstream and used in logs.
	pub fn subject(&self) -> String {
		match (&self.client_id, &self.user_id, self.subject_type) {
			(_, Some(user), SubjectType::User) => format!("user:{user}"),
			(Some(client), _, _) => format!("client:{client}"),
			(None, Some(user), _) => format!("user:{user}"),
			(None, None, _) => "anonymous".to_string(),
		}
	}
}

/// Key that rate windows are scoped to.
///
/// The calling client wins; user tokens without a bound client fall back to
/// the user and anonymous callers to their address.
pub fn caller_key(identity: Option<&Identity>, ip: Option<IpAddr>) -> String {
	if let Some(identity) = identity {
		if let Some(client) = &identity.client_id {
			return format!("client:{client}");
		}
		if let Some(user) = &identity.user_id {
			return format!("user:{user}");
		}
	}
	match ip {
		Some(ip) => format!("ip:{ip}"),
		None => "ip:unknown".to_string(),
	}
}
