//! Compiled policy: authentication, backend mapping, and deny-rule
//! evaluation (§4.3). Built once from a `Config` and shared read-only
//! across every connection worker.

use std::net::{IpAddr, SocketAddr};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::error::{AuthError, PolicyError};
use crate::http::message::HeaderList;

/// View over the subset of the request the policy engine needs, so
/// callers don't have to depend on the full worker state machine.
pub struct AuthContext<'a> {
	pub peer_ip: IpAddr,
	pub headers: &'a HeaderList,
}

pub struct PolicyEngine<'a> {
	config: &'a Config,
}

impl<'a> PolicyEngine<'a> {
	pub fn new(config: &'a Config) -> Self {
		Self { config }
	}

	/// §4.3 Authentication. Trusted-header auth is tried first and only
	/// if the peer is in `auth_whitelist`; otherwise falls back to Basic
	/// auth.
	pub fn authenticate(&self, ctx: &AuthContext) -> Result<String, AuthError> {
		if self.peer_is_whitelisted(ctx.peer_ip)
			&& let Some(trusted) = ctx.headers.get(&self.config.auth_header_name)
		{
			return Ok(trusted.to_string());
		}
		self.authenticate_basic(ctx.headers)
	}

	fn peer_is_whitelisted(&self, peer: IpAddr) -> bool {
		self.config.auth_whitelist.iter().any(|net| net.contains(&peer))
	}

	fn authenticate_basic(&self, headers: &HeaderList) -> Result<String, AuthError> {
		let raw = headers.get("Authorization").ok_or(AuthError::Missing)?;
		let encoded = raw.strip_prefix("Basic ").ok_or(AuthError::BadFormat)?;
		let decoded = BASE64.decode(encoded.trim()).map_err(|_| AuthError::BadFormat)?;
		let decoded = String::from_utf8(decoded).map_err(|_| AuthError::BadFormat)?;
		let (username, password) = decoded.split_once(':').ok_or(AuthError::BadFormat)?;

		match self.config.users.get(username) {
			Some(expected) => {
				if passwords_equal(expected, password) {
					Ok(username.to_string())
				} else {
					Err(AuthError::BadCredentials)
				}
			},
			None if self.config.allow_any_user => Ok(username.to_string()),
			None => Err(AuthError::BadCredentials),
		}
	}

	/// §4.3 Mapping: first-match regex wins, falling back to
	/// `default_server_name`.
	pub fn resolve_backend(&self, username: &str) -> Result<(String, SocketAddr), PolicyError> {
		let server_name = self
			.config
			.mappings
			.iter()
			.find(|m| m.user_regex.is_match(username))
			.map(|m| m.server_name.clone())
			.or_else(|| self.config.default_server_name.clone())
			.ok_or(PolicyError::NoBackend)?;

		let addr = self.config.backend_addr(&server_name).ok_or(PolicyError::NoBackend)?;
		Ok((server_name, addr))
	}

	/// §4.3 Deny evaluation: all five fields of a rule must match for it
	/// to fire. `body` is `None` when the request body was never
	/// buffered (no rule needs it, or it streamed past the ceiling); a
	/// rule with a non-trivial body regex against a `None` body does not
	/// match, matching the "documented imprecision" allowance for bodies
	/// exceeding the configured ceiling.
	pub fn first_matching_deny_rule(
		&self,
		username: &str,
		method: &str,
		target: &str,
		rendered_headers: &str,
		body: Option<&[u8]>,
	) -> Option<&str> {
		for rule in &self.config.deny_rules {
			if !rule.user_regex.is_match(username) {
				continue;
			}
			if !rule.method_regex.is_match(method) {
				continue;
			}
			if !rule.url_regex.is_match(target) {
				continue;
			}
			if !rule.header_regex.is_match(rendered_headers) {
				continue;
			}
			let body_matches = if rule.body_regex_is_trivial {
				true
			} else {
				match body {
					Some(b) => match std::str::from_utf8(b) {
						Ok(s) => rule.body_regex.is_match(s),
						Err(_) => rule.body_regex.is_match(&String::from_utf8_lossy(b)),
					},
					None => false,
				}
			};
			if body_matches {
				return Some(&rule.id);
			}
		}
		None
	}

	/// §4.5: is there a project filter for this user, and what's its
	/// pattern. Only the first match applies.
	pub fn project_filter_for(&self, username: &str) -> Option<&regex::Regex> {
		self
			.config
			.project_filters
			.iter()
			.find(|f| f.user_regex.is_match(username))
			.map(|f| &f.project_regex)
	}

	pub fn needs_body_buffering(&self) -> bool {
		self.config.needs_body_buffering()
	}

	pub fn backend_credentials_header(&self) -> String {
		let raw = format!("{}:{}", self.config.backend_user, self.config.backend_password);
		format!("Basic {}", BASE64.encode(raw))
	}
}

/// Constant-time string comparison, per the explicit requirement that
/// password checks not leak timing information (§4.3 step 3).
fn passwords_equal(expected: &str, supplied: &str) -> bool {
	if expected.len() != supplied.len() {
		return false;
	}
	expected.as_bytes().ct_eq(supplied.as_bytes()).into()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::load_from_str;

	const SAMPLE: &str = r#"
[proxy]
backend_user=admin
backend_password=password
default_server_name=gns3-1
auth_whitelist=10.0.0.0/24
auth_header_name=X-Auth-Username

[servers]
gns3-1=127.0.0.1

[users]
alice=wonder

[mapping]
m1="alice":"gns3-1"

[project-filter]
p1="alice":"(.*)Group1(.*)"

[deny]
r1="alice":"DELETE":"":"":""
"#;

	fn engine(cfg: &crate::config::Config) -> PolicyEngine<'_> {
		PolicyEngine::new(cfg)
	}

	#[test]
	fn basic_auth_success() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let p = engine(&cfg);
		let mut headers = HeaderList::new();
		headers.push("Authorization", "Basic YWxpY2U6d29uZGVy");
		let ctx = AuthContext {
			peer_ip: "203.0.113.9".parse().unwrap(),
			headers: &headers,
		};
		assert_eq!(p.authenticate(&ctx).unwrap(), "alice");
	}

	#[test]
	fn basic_auth_wrong_password() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let p = engine(&cfg);
		let mut headers = HeaderList::new();
		headers.push("Authorization", "Basic YWxpY2U6bm9wZQ==");
		let ctx = AuthContext {
			peer_ip: "203.0.113.9".parse().unwrap(),
			headers: &headers,
		};
		assert_eq!(p.authenticate(&ctx).unwrap_err(), AuthError::BadCredentials);
	}

	#[test]
	fn trusted_header_only_from_whitelisted_peer() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let p = engine(&cfg);
		let mut headers = HeaderList::new();
		headers.push("X-Auth-Username", "alice");
		let trusted_ctx = AuthContext {
			peer_ip: "10.0.0.7".parse().unwrap(),
			headers: &headers,
		};
		assert_eq!(p.authenticate(&trusted_ctx).unwrap(), "alice");

		let untrusted_ctx = AuthContext {
			peer_ip: "10.0.1.7".parse().unwrap(),
			headers: &headers,
		};
		assert_eq!(p.authenticate(&untrusted_ctx).unwrap_err(), AuthError::Missing);
	}

	#[test]
	fn mapping_resolves_backend() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let p = engine(&cfg);
		let (name, addr) = p.resolve_backend("alice").unwrap();
		assert_eq!(name, "gns3-1");
		assert_eq!(addr.ip().to_string(), "127.0.0.1");
	}

	#[test]
	fn unmapped_user_without_default_fails() {
		let text = SAMPLE.replace("default_server_name=gns3-1\n", "");
		let cfg = load_from_str(&text).unwrap();
		let p = engine(&cfg);
		assert_eq!(p.resolve_backend("bob").unwrap_err(), PolicyError::NoBackend);
	}

	#[test]
	fn deny_rule_fires_on_all_five_fields() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let p = engine(&cfg);
		let hit = p.first_matching_deny_rule("alice", "DELETE", "/v2/projects/X", "Host: x\r\n", None);
		assert_eq!(hit, Some("r1"));
	}

	#[test]
	fn deny_rule_does_not_fire_for_other_methods() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let p = engine(&cfg);
		let hit = p.first_matching_deny_rule("alice", "GET", "/v2/projects/X", "Host: x\r\n", None);
		assert_eq!(hit, None);
	}

	#[test]
	fn project_filter_matches_configured_user() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let p = engine(&cfg);
		let re = p.project_filter_for("alice").unwrap();
		assert!(re.is_match("ProjectGroup1A"));
		assert!(!re.is_match("ProjectGroup2B"));
		assert!(p.project_filter_for("bob").is_none());
	}

	#[test]
	fn backend_credentials_header_is_rewritten() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let p = engine(&cfg);
		assert_eq!(p.backend_credentials_header(), "Basic YWRtaW46cGFzc3dvcmQ=");
	}
}
