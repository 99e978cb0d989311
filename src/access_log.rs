//! Access logging (§4.6): one structured line per completed request, on a
//! `tracing` target dedicated to access logs so it can be routed (and
//! filtered) independently of debug-level diagnostics.

use std::net::IpAddr;
use std::time::Duration;

pub const TARGET: &str = "gns3_proxy::access";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
	Ok,
	Deny,
	AuthFail,
	NoBackend,
	BackendUnreachable,
	ClientAbort,
	IdleTimeout,
	/// Malformed HTTP on the client side. Not one of the originally
	/// enumerated tags; added because a parse failure is otherwise
	/// indistinguishable from a client abort in the log.
	BadRequest,
}

impl Disposition {
	/// The tag format used in the log line (§4.6): `DENY rule-N` carries
	/// the rule id, everything else is a fixed string.
	pub fn tag(&self, deny_rule_id: Option<&str>) -> String {
		match self {
			Disposition::Ok => "OK".to_string(),
			Disposition::Deny => format!("DENY {}", deny_rule_id.unwrap_or("?")),
			Disposition::AuthFail => "AUTH-FAIL".to_string(),
			Disposition::NoBackend => "NO-BACKEND".to_string(),
			Disposition::BackendUnreachable => "BACKEND-UNREACHABLE".to_string(),
			Disposition::ClientAbort => "CLIENT-ABORT".to_string(),
			Disposition::IdleTimeout => "IDLE-TIMEOUT".to_string(),
			Disposition::BadRequest => "BAD-REQUEST".to_string(),
		}
	}
}

pub struct AccessLogEntry<'a> {
	pub peer_ip: IpAddr,
	pub username: Option<&'a str>,
	pub method: &'a str,
	pub target: &'a str,
	pub backend_name: Option<&'a str>,
	pub status: Option<u16>,
	pub response_bytes: u64,
	pub duration: Duration,
	pub disposition: Disposition,
	pub deny_rule_id: Option<&'a str>,
}

/// Emits exactly one access-log line. The worker calls this once per
/// completed request regardless of how it concluded; timestamps come
/// from the log sink, not from this struct.
pub fn record(entry: &AccessLogEntry) {
	tracing::info!(
		target: TARGET,
		peer_ip = %entry.peer_ip,
		username = entry.username.unwrap_or("-"),
		method = entry.method,
		target = entry.target,
		backend = entry.backend_name.unwrap_or("-"),
		status = entry.status.map(|s| s as i32).unwrap_or(-1),
		response_bytes = entry.response_bytes,
		duration_ms = entry.duration.as_millis() as u64,
		disposition = %entry.disposition.tag(entry.deny_rule_id),
		"request",
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deny_tag_carries_rule_id() {
		assert_eq!(Disposition::Deny.tag(Some("r1")), "DENY r1");
	}

	#[test]
	fn ok_tag_has_no_rule_id() {
		assert_eq!(Disposition::Ok.tag(None), "OK");
	}
}
