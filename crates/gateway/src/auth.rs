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

//! Caller authentication for Gateway
//!
//! Two independent strategies identify who is calling:
//!
//! - **API key / secret** (machine-to-machine): `X-API-Key` names the client,
//!   `X-API-Secret` proves possession. The secret is compared as a SHA-256
//!   digest in constant time, and the caller address must fall inside the
//!   client's allow-list.
//! - **Bearer token** (user context): `Authorization: Bearer <token>` carries
//!   an opaque token. Only its SHA-256 digest is looked up; the token binds a
//!   user and optionally an API client.
//!
//! The key pair is tried first. A request carrying neither is rejected before
//! any record is read.
//!
//! # Authentication Material Location
//!
//! Credentials are read from request headers only, never from the body or the
//! query string, so they are not logged by intermediaries that record URLs.

use std::{collections::BTreeSet, net::IpAddr, sync::Arc};

use actix_web::http::{StatusCode, header::HeaderMap};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
	directory::{AccessTokenRecord, ApiClientRecord, Directory, DirectoryError, UserRecord},
	identity::{AuthMethod, Identity, Role, SubjectType},
};

pub const HEADER_API_KEY: &str = "X-API-Key";
pub const HEADER_API_SECRET: &str = "X-API-Secret";

/// Token type accepted on the public API
pub const PUBLIC_API_TOKEN_TYPE: &str = "public_api";

/// Error types for authentication operations
#[derive(Debug, Error)]
pub enum AuthError {
	#[error(
		"Authentication required. Provide X-API-Key and X-API-Secret headers, or an Authorization: Bearer token"
	)]
	MissingCredentials,
	#[error("Invalid API key or secret")]
	InvalidCredentials,
	#[error("API client is deactivated")]
	ClientInactive,
	#[error("Requests from this IP address are not allowed for this client")]
	IpNotAllowed,
	#[error("Invalid access token")]
	TokenInvalid,
	#[error("Access token has expired")]
	TokenExpired,
	#[error(transparent)]
	Directory(#[from] DirectoryError),
}

impl AuthError {
	pub fn code(&self) -> &'static str {
		match self {
			AuthError::MissingCredentials => "UNAUTHORIZED",
			AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
			AuthError::ClientInactive | AuthError::IpNotAllowed => "FORBIDDEN",
			AuthError::TokenInvalid => "TOKEN_INVALID",
			AuthError::TokenExpired => "TOKEN_EXPIRED",
			AuthError::Directory(_) => "SERVICE_UNAVAILABLE",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			AuthError::ClientInactive | AuthError::IpNotAllowed => StatusCode::FORBIDDEN,
			AuthError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
			_ => StatusCode::UNAUTHORIZED,
		}
	}
}

/// Credentials found in request headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
	ApiKey { key: String, secret: String },
	Bearer(String),
}

impl Credentials {
	/// Extract credentials from headers, preferring the API key pair.
	///
	/// Returns `None` when neither a complete key pair nor a bearer token is
	/// present. Header names are case-insensitive; the `Bearer` scheme is too.
	pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
		if let Some(key) = header_str(headers, HEADER_API_KEY)
			&& let Some(secret) = header_str(headers, HEADER_API_SECRET)
		{
			return Some(Credentials::ApiKey {
				key: key.to_string(),
				secret: secret.to_string(),
			});
		}

		if let Some(value) = header_str(headers, "authorization")
			&& let Some((scheme, token)) = value.split_once(' ')
			&& scheme.eq_ignore_ascii_case("bearer")
			&& !token.trim().is_empty()
		{
			return Some(Credentials::Bearer(token.trim().to_string()));
		}

		None
	}
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers
		.get(name)
		.and_then(|v| v.to_str().ok())
		.map(str::trim)
		.filter(|v| !v.is_empty())
}

/// Lower-case hex SHA-256 digest, the form secrets and tokens are stored in.
pub fn sha256_hex(input: &str) -> String {
	hex::encode(Sha256::digest(input.as_bytes()))
}

fn secret_matches(secret: &str, stored_sha256: &str) -> bool {
	let presented = sha256_hex(secret);
	let stored = stored_sha256.trim().to_ascii_lowercase();
	presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// Identifies callers against the [`Directory`]
pub struct ClientAuthenticator {
	directory: Arc<dyn Directory>,
}

impl ClientAuthenticator {
	pub fn new(directory: Arc<dyn Directory>) -> Self {
		Self { directory }
	}

	/// Authenticate a request.
	///
	/// # Arguments
	/// * `headers` - Request headers carrying the credentials
	/// * `caller_ip` - Address checked against API client allow-lists
	/// * `now` - Reference time for token expiry and "last used" stamps
	pub async fn authenticate(
		&self,
		headers: &HeaderMap,
		caller_ip: Option<IpAddr>,
		now: DateTime<Utc>,
	) -> Result<Identity, AuthError> {
		match Credentials::from_headers(headers).ok_or(AuthError::MissingCredentials)? {
			Credentials::ApiKey { key, secret } => {
				self.authenticate_api_key(&key, &secret, caller_ip, now)
					.await
			}
			Credentials::Bearer(token) => self.authenticate_bearer(&token, now).await,
		}
	}

	async fn authenticate_api_key(
		&self,
		key: &str,
		secret: &str,
		caller_ip: Option<IpAddr>,
		now: DateTime<Utc>,
	) -> Result<Identity, AuthError> {
		let Some(client) = self.directory.find_client_by_key(key).await? else {
			// Keep the digest work on the miss path too.
			let _ = secret_matches(secret, "");
			debug!(target: "gateway::auth", "Unknown API key");
			return Err(AuthError::InvalidCredentials);
		};

		if !secret_matches(secret, &client.secret_sha256) {
			debug!(target: "gateway::auth", client_id = %client.id, "API secret mismatch");
			return Err(AuthError::InvalidCredentials);
		}
		if !client.active {
			return Err(AuthError::ClientInactive);
		}
		if !client.allows_ip(caller_ip) {
			warn!(
				target: "gateway::auth",
				client_id = %client.id,
				ip = ?caller_ip,
				"Request from address outside client allow-list"
			);
			return Err(AuthError::IpNotAllowed);
		}

		if let Err(e) = self.directory.touch_client(&client.id, now).await {
			warn!(target: "gateway::auth", client_id = %client.id, error = %e, "Failed to record client usage");
		}

		Ok(client_identity(client))
	}

	async fn authenticate_bearer(
		&self,
		token: &str,
		now: DateTime<Utc>,
	) -> Result<Identity, AuthError> {
		let record = self
			.directory
			.find_token(&sha256_hex(token))
			.await?
			.ok_or(AuthError::TokenInvalid)?;

		if let Some(expires_at) = record.expires_at
			&& expires_at <= now
		{
			return Err(AuthError::TokenExpired);
		}
		if record.token_type != PUBLIC_API_TOKEN_TYPE {
			debug!(
				target: "gateway::auth",
				token_id = %record.id,
				token_type = %record.token_type,
				"Token type not accepted on the public API"
			);
			return Err(AuthError::TokenInvalid);
		}

		let client = match &record.client_id {
			Some(client_id) => {
				let client = self
					.directory
					.find_client(client_id)
					.await?
					.ok_or(AuthError::TokenInvalid)?;
				if !client.active {
					return Err(AuthError::TokenInvalid);
				}
				Some(client)
			}
			None => None,
		};

		let user = self
			.directory
			.find_user(&record.user_id)
			.await?
			.filter(|u| u.active)
			.ok_or(AuthError::TokenInvalid)?;

		if let Err(e) = self.directory.touch_token(&record.id, now).await {
			warn!(target: "gateway::auth", token_id = %record.id, error = %e, "Failed to record token usage");
		}

		Ok(token_identity(record, user, client))
	}
}

fn client_identity(client: ApiClientRecord) -> Identity {
	// A client bound to one restaurant acts as its staff; an unbound client
	// acts for its whole tenant.
	let role = if client.restaurant_id.is_some() {
		Role::Staff
	} else {
		Role::TenantOwner
	};

	Identity {
		subject_type: SubjectType::Client,
		client_id: Some(client.id),
		user_id: None,
		tenant_id: Some(client.tenant_id),
		restaurant_id: client.restaurant_id,
		role,
		scopes: client.scopes.into_iter().collect(),
		auth_method: AuthMethod::ApiKey,
		plan: client.plan,
		custom_limits: client.custom_limits,
		utc_offset_minutes: client.utc_offset_minutes,
	}
}

fn token_identity(
	token: AccessTokenRecord,
	user: UserRecord,
	client: Option<ApiClientRecord>,
) -> Identity {
	let restaurant_id = client
		.as_ref()
		.and_then(|c| c.restaurant_id.clone())
		.or(user.restaurant_id);

	Identity {
		subject_type: SubjectType::User,
		client_id: client.as_ref().map(|c| c.id.clone()),
		user_id: Some(user.id),
		tenant_id: user.tenant_id,
		restaurant_id,
		role: user.role,
		scopes: token.abilities.into_iter().collect::<BTreeSet<_>>(),
		auth_method: AuthMethod::Bearer,
		plan: client.as_ref().and_then(|c| c.plan.clone()),
		custom_limits: client.as_ref().and_then(|c| c.custom_limits),
		utc_offset_minutes: client.as_ref().and_then(|c| c.utc_offset_minutes),
	}
}
