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

//! Multi-tenant API gateway for the restaurant platform
//!
//! Every public API request passes through a fixed pipeline before it reaches
//! the business backend: authentication, restaurant resolution and isolation,
//! scope checks, rate limiting and idempotent replay. See [`pipeline`] for the
//! stage order.
//!
//! The gateway holds no authoritative state. Counters and idempotency records
//! live in a shared store (`tavola-store`), business records behind the
//! [`directory::Directory`] trait.

pub mod auth;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod identity;
pub mod logging;
pub mod middleware;
pub mod pipeline;
pub mod rate_limit;
pub mod request;
pub mod request_context;
pub mod routes;
pub mod scope;
pub mod server;
pub mod tenant;
