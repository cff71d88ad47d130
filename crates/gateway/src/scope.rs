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

//! Scope checks against a route's declared requirement

use std::collections::BTreeSet;

use thiserror::Error;

/// Grants every scope
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Insufficient scope. This route requires one of: {}", .required.join(", "))]
pub struct ScopeError {
	pub required: Vec<String>,
	pub granted: Vec<String>,
}

/// Whether one granted scope satisfies one required scope.
///
/// `*` matches everything and `resource:*` matches any `resource:action`.
pub fn scope_matches(granted: &str, required: &str) -> bool {
	if granted == WILDCARD || granted == required {
		return true;
	}
	match granted.strip_suffix('*') {
		Some(prefix) if prefix.ends_with(':') => required.starts_with(prefix),
		_ => false,
	}
}

/// Allow if any granted scope satisfies any required one.
///
/// An empty requirement admits every identity.
pub fn authorize(granted: &BTreeSet<String>, required: &[String]) -> Result<(), ScopeError> {
	if required.is_empty() {
		return Ok(());
	}

	let allowed = required
		.iter()
		.any(|req| granted.iter().any(|g| scope_matches(g, req)));
	if allowed {
		Ok(())
	} else {
		Err(ScopeError {
			required: required.to_vec(),
			granted: granted.iter().cloned().collect(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn set(scopes: &[&str]) -> BTreeSet<String> {
		scopes.iter().map(|s| s.to_string()).collect()
	}

	fn req(scopes: &[&str]) -> Vec<String> {
		scopes.iter().map(|s| s.to_string()).collect()
	}

	#[test]
	fn matching_rules() {
		assert!(scope_matches("*", "orders:write"));
		assert!(scope_matches("orders:write", "orders:write"));
		assert!(scope_matches("menu:*", "menu:read"));
		assert!(!scope_matches("menu:*", "menus:read"));
		assert!(!scope_matches("menu:read", "menu:write"));
		assert!(!scope_matches("menu*", "menu:read"));
	}

	#[test]
	fn resource_wildcard_grants_action() {
		assert!(authorize(&set(&["menu:*"]), &req(&["menu:read"])).is_ok());
	}

	#[test]
	fn denial_reports_both_sets() {
		let err = authorize(&set(&["menu:*"]), &req(&["orders:read"])).unwrap_err();
		assert_eq!(err.required, vec!["orders:read".to_string()]);
		assert_eq!(err.granted, vec!["menu:*".to_string()]);
	}

	#[test]
	fn any_required_scope_suffices() {
		assert!(authorize(&set(&["reports:read"]), &req(&["finance:read", "reports:read"])).is_ok());
	}

	#[test]
	fn empty_requirement_admits_anyone() {
		assert!(authorize(&BTreeSet::new(), &[]).is_ok());
		assert!(authorize(&BTreeSet::new(), &req(&["menu:read"])).is_err());
	}
}
