//! Shared fixtures for the gateway integration tests

#![allow(dead_code)]

use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};

use actix_web::http::{Method, StatusCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tavola_gateway::{
	auth::sha256_hex,
	config::{GatewayConfig, RateLimits, RouteBinding, RouteSpec},
	directory::{
		AccessTokenRecord, ApiClientRecord, DeviceRecord, Directory, DirectoryError,
		DirectoryResult, DirectorySeed, EntityRecord, MemoryDirectory, RestaurantRecord,
		UserRecord,
	},
	dispatcher::{DispatchError, DispatchRequest, RequestHandler},
	identity::Role,
	request::{GatewayRequest, GatewayResponse},
};
use tavola_store::{CounterStore, MemoryStore, StoreError, StoreResult, WindowSnapshot};

pub const MENU_KEY: &str = "key-menu";
pub const MENU_SECRET: &str = "secret-menu";
pub const WRITER_KEY: &str = "key-writer";
pub const WRITER_SECRET: &str = "secret-writer";
pub const STAFF_TOKEN: &str = "tok-staff";
/// Tokens of two waiters signed in through the writer client
pub const WAITER_A_TOKEN: &str = "tok-waiter-a";
pub const WAITER_B_TOKEN: &str = "tok-waiter-b";

/// Per-minute limit of the menu client
pub const MENU_RPM: u64 = 3;

/// Noon tomorrow. Stores expire keys against the wall clock, so test time
/// must not lie in the past.
pub fn base_time() -> DateTime<Utc> {
	let tomorrow = Utc::now().date_naive().succ_opt().unwrap();
	tomorrow.and_hms_opt(12, 0, 0).unwrap().and_utc()
}

fn client(id: &str, key: &str, secret: &str, scopes: &[&str]) -> ApiClientRecord {
	ApiClientRecord {
		id: id.to_string(),
		name: id.to_string(),
		api_key: key.to_string(),
		secret_sha256: sha256_hex(secret),
		tenant_id: "t-1".to_string(),
		restaurant_id: Some("r-1".to_string()),
		scopes: scopes.iter().map(|s| s.to_string()).collect(),
		active: true,
		allowed_ips: vec![],
		plan: None,
		custom_limits: None,
		utc_offset_minutes: None,
		last_used_at: None,
	}
}

fn staff(id: &str) -> UserRecord {
	UserRecord {
		id: id.to_string(),
		tenant_id: Some("t-1".to_string()),
		restaurant_id: Some("r-1".to_string()),
		role: Role::Staff,
		active: true,
	}
}

fn token(id: &str, bearer: &str, user_id: &str, client_id: Option<&str>) -> AccessTokenRecord {
	AccessTokenRecord {
		id: id.to_string(),
		token_sha256: sha256_hex(bearer),
		user_id: user_id.to_string(),
		client_id: client_id.map(str::to_string),
		token_type: "public_api".to_string(),
		abilities: vec!["orders:*".to_string()],
		expires_at: None,
		last_used_at: None,
	}
}

pub fn directory() -> MemoryDirectory {
	let mut menu = client("c-menu", MENU_KEY, MENU_SECRET, &["menu:*"]);
	menu.custom_limits = Some(RateLimits {
		requests_per_minute: MENU_RPM,
		burst: 0,
		daily_limit: 0,
	});

	MemoryDirectory::from_seed(DirectorySeed {
		clients: vec![
			menu,
			client(
				"c-writer",
				WRITER_KEY,
				WRITER_SECRET,
				&["orders:write", "orders:read"],
			),
		],
		users: vec![staff("u-staff"), staff("u-waiter-a"), staff("u-waiter-b")],
		tokens: vec![
			token("tok-1", STAFF_TOKEN, "u-staff", None),
			token("tok-2", WAITER_A_TOKEN, "u-waiter-a", Some("c-writer")),
			token("tok-3", WAITER_B_TOKEN, "u-waiter-b", Some("c-writer")),
		],
		devices: vec![],
		restaurants: vec![
			RestaurantRecord {
				id: "r-1".to_string(),
				tenant_id: "t-1".to_string(),
				name: "Trattoria Uno".to_string(),
			},
			RestaurantRecord {
				id: "r-2".to_string(),
				tenant_id: "t-2".to_string(),
				name: "Osteria Due".to_string(),
			},
		],
		entities: vec![
			EntityRecord {
				kind: "table".to_string(),
				id: "tbl-1".to_string(),
				restaurant_id: "r-1".to_string(),
			},
			EntityRecord {
				kind: "table".to_string(),
				id: "tbl-2".to_string(),
				restaurant_id: "r-2".to_string(),
			},
		],
	})
}

fn route(name: &str, method: &str, path: &str, scopes: &[&str]) -> RouteSpec {
	RouteSpec {
		name: name.to_string(),
		method: method.to_string(),
		path: path.to_string(),
		scopes: scopes.iter().map(|s| s.to_string()).collect(),
		bindings: vec![],
		public: false,
	}
}

pub fn menu_route() -> RouteSpec {
	route("menu.show", "GET", "/api/v1/menu", &["menu:read"])
}

pub fn orders_list_route() -> RouteSpec {
	route("orders.list", "GET", "/api/v1/orders", &["orders:read"])
}

pub fn order_create_route() -> RouteSpec {
	let mut route_spec = route(
		"tables.orders.create",
		"POST",
		"/api/v1/tables/{table_id}/orders",
		&["orders:write"],
	);
	route_spec.bindings = vec![RouteBinding {
		param: "table_id".to_string(),
		entity: "table".to_string(),
	}];
	route_spec
}

pub fn order_delete_route() -> RouteSpec {
	route(
		"orders.delete",
		"DELETE",
		"/api/v1/orders/{order_id}",
		&["orders:write"],
	)
}

pub fn public_menu_route() -> RouteSpec {
	let mut route_spec = route("public.menu", "GET", "/public/menu", &[]);
	route_spec.public = true;
	route_spec
}

pub fn config() -> GatewayConfig {
	let mut config = GatewayConfig::default();
	config.routes = vec![
		menu_route(),
		orders_list_route(),
		order_create_route(),
		order_delete_route(),
		public_menu_route(),
	];
	config
}

pub fn with_api_key(request: GatewayRequest, key: &str, secret: &str) -> GatewayRequest {
	request
		.with_header("X-API-Key", key)
		.with_header("X-API-Secret", secret)
}

pub fn create_order(table_id: &str, body: &str) -> GatewayRequest {
	GatewayRequest::new(Method::POST, format!("/api/v1/tables/{table_id}/orders"))
		.with_path_param("table_id", table_id)
		.with_header("content-type", "application/json")
		.with_body(body.to_string())
}

/// Handler that counts its invocations and echoes what it was given
#[derive(Default)]
pub struct CountingHandler {
	calls: AtomicUsize,
}

impl CountingHandler {
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl RequestHandler for CountingHandler {
	async fn handle(&self, dispatch: DispatchRequest<'_>) -> Result<GatewayResponse, DispatchError> {
		let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
		let status = if dispatch.request.method == Method::POST {
			StatusCode::CREATED
		} else {
			StatusCode::OK
		};
		Ok(GatewayResponse::json(
			status,
			&serde_json::json!({
				"success": true,
				"call": call,
				"route": dispatch.route.name,
				"restaurant_id": dispatch.tenant.map(|t| t.restaurant_id.clone()),
			}),
		))
	}
}

/// Store that is never reachable and counts how often it was asked
#[derive(Default)]
pub struct UnreachableStore {
	calls: AtomicUsize,
}

impl UnreachableStore {
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	fn fail<T>(&self) -> StoreResult<T> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		Err(StoreError::Unavailable("connection refused".to_string()))
	}
}

#[async_trait]
impl CounterStore for UnreachableStore {
	async fn window_snapshot(&self, _key: &str, _cutoff_ms: i64) -> StoreResult<WindowSnapshot> {
		self.fail()
	}

	async fn window_record(
		&self,
		_key: &str,
		_at_ms: i64,
		_member: &str,
		_ttl: Duration,
	) -> StoreResult<()> {
		self.fail()
	}

	async fn increment_until(&self, _key: &str, _expire_at: i64) -> StoreResult<u64> {
		self.fail()
	}

	async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
		self.fail()
	}

	async fn put(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<()> {
		self.fail()
	}

	async fn put_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
		self.fail()
	}

	async fn remove(&self, _key: &str) -> StoreResult<()> {
		self.fail()
	}
}

pub fn handler() -> Arc<CountingHandler> {
	Arc::new(CountingHandler::default())
}

/// Store whose rate windows work but whose key/value records are unreachable
#[derive(Default)]
pub struct RecordOutageStore {
	windows: MemoryStore,
	failures: AtomicUsize,
}

impl RecordOutageStore {
	pub fn failures(&self) -> usize {
		self.failures.load(Ordering::SeqCst)
	}

	fn fail<T>(&self) -> StoreResult<T> {
		self.failures.fetch_add(1, Ordering::SeqCst);
		Err(StoreError::Timeout(Duration::from_millis(250)))
	}
}

#[async_trait]
impl CounterStore for RecordOutageStore {
	async fn window_snapshot(&self, key: &str, cutoff_ms: i64) -> StoreResult<WindowSnapshot> {
		self.windows.window_snapshot(key, cutoff_ms).await
	}

	async fn window_record(&self, key: &str, at_ms: i64, member: &str, ttl: Duration) -> StoreResult<()> {
		self.windows.window_record(key, at_ms, member, ttl).await
	}

	async fn increment_until(&self, key: &str, expire_at: i64) -> StoreResult<u64> {
		self.windows.increment_until(key, expire_at).await
	}

	async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
		self.fail()
	}

	async fn put(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<()> {
		self.fail()
	}

	async fn put_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
		self.fail()
	}

	async fn remove(&self, _key: &str) -> StoreResult<()> {
		self.fail()
	}
}

/// Directory whose "last used" bookkeeping always fails
pub struct UntouchableDirectory {
	inner: MemoryDirectory,
	touches: AtomicUsize,
}

impl UntouchableDirectory {
	pub fn new(inner: MemoryDirectory) -> Self {
		Self {
			inner,
			touches: AtomicUsize::new(0),
		}
	}

	pub fn touches(&self) -> usize {
		self.touches.load(Ordering::SeqCst)
	}

	fn refuse(&self) -> DirectoryResult<()> {
		self.touches.fetch_add(1, Ordering::SeqCst);
		Err(DirectoryError::Unavailable("read-only replica".to_string()))
	}
}

#[async_trait]
impl Directory for UntouchableDirectory {
	async fn find_client_by_key(&self, api_key: &str) -> DirectoryResult<Option<ApiClientRecord>> {
		self.inner.find_client_by_key(api_key).await
	}

	async fn find_client(&self, id: &str) -> DirectoryResult<Option<ApiClientRecord>> {
		self.inner.find_client(id).await
	}

	async fn find_token(&self, token_sha256: &str) -> DirectoryResult<Option<AccessTokenRecord>> {
		self.inner.find_token(token_sha256).await
	}

	async fn find_user(&self, id: &str) -> DirectoryResult<Option<UserRecord>> {
		self.inner.find_user(id).await
	}

	async fn find_device_unscoped(&self, device_id: &str) -> DirectoryResult<Option<DeviceRecord>> {
		self.inner.find_device_unscoped(device_id).await
	}

	async fn find_restaurant_unscoped(
		&self,
		id: &str,
	) -> DirectoryResult<Option<RestaurantRecord>> {
		self.inner.find_restaurant_unscoped(id).await
	}

	async fn restaurant_of(&self, kind: &str, id: &str) -> DirectoryResult<Option<String>> {
		self.inner.restaurant_of(kind, id).await
	}

	async fn touch_client(&self, _id: &str, _at: DateTime<Utc>) -> DirectoryResult<()> {
		self.refuse()
	}

	async fn touch_token(&self, _id: &str, _at: DateTime<Utc>) -> DirectoryResult<()> {
		self.refuse()
	}
}
