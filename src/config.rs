//! Loads the INI configuration file into an immutable snapshot (§3, §6).
//! Everything downstream — the policy engine, the acceptor, the workers —
//! only ever sees a `Config` built here; there is no mutable config path.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ini::Ini;
use ipnet::IpNet;
use regex::Regex;

use crate::error::ConfigError;

pub const DEFAULT_BIND_PORT: u16 = 14080;
pub const DEFAULT_BACKEND_PORT: u16 = 3080;
pub const DEFAULT_AUTH_HEADER: &str = "X-Auth-Username";
pub const DEFAULT_REAL_IP_HEADER: &str = "X-Forwarded-For";
const DEFAULT_BODY_MATCH_CEILING: u64 = 1024 * 1024;

/// One (user-regex, server-name) or (user-regex, project-regex) rule,
/// first-match-wins against an ordered list.
#[derive(Debug, Clone)]
pub struct MappingRule {
	pub id: String,
	pub user_regex: Regex,
	pub server_name: String,
}

#[derive(Debug, Clone)]
pub struct ProjectFilterRule {
	pub id: String,
	pub user_regex: Regex,
	pub project_regex: Regex,
}

/// A conjunctive deny rule: all five fields must match for the rule to
/// fire (§4.3). An empty pattern string matches anything.
#[derive(Debug, Clone)]
pub struct DenyRule {
	pub id: String,
	pub user_regex: Regex,
	pub method_regex: Regex,
	pub url_regex: Regex,
	pub header_regex: Regex,
	pub body_regex: Regex,
	/// Whether `body_regex` is the "match anything" empty pattern. Cached
	/// so the policy engine can skip body buffering for connections where
	/// no deny rule actually inspects the body.
	pub body_regex_is_trivial: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub bind_addr: IpAddr,
	pub bind_port: u16,

	pub backend_user: String,
	pub backend_password: String,
	pub backend_port: u16,

	pub default_server_name: Option<String>,

	pub backlog: u32,
	pub server_recvbuf: usize,
	pub client_recvbuf: usize,
	pub open_file_limit: u64,
	pub inactivity_timeout: Duration,

	pub auth_whitelist: Vec<IpNet>,
	pub auth_header_name: String,
	pub real_ip_header_name: String,
	pub allow_any_user: bool,

	pub servers: HashMap<String, IpAddr>,
	pub users: HashMap<String, String>,
	pub mappings: Vec<MappingRule>,
	pub project_filters: Vec<ProjectFilterRule>,
	pub deny_rules: Vec<DenyRule>,

	/// Deny rules with a non-trivial body regex force the worker to
	/// buffer request bodies up to this ceiling before evaluating deny
	/// rules (§4.3's "documented imprecision" allowance). Not an INI key
	/// in the reference config; exposed here so it can be tuned without
	/// a code change.
	pub deny_body_match_ceiling: u64,
	/// Ceiling for project-list response buffering (§4.5).
	pub project_filter_body_ceiling: u64,
	pub log_level: String,
}

impl Config {
	pub fn backend_addr(&self, name: &str) -> Option<SocketAddr> {
		self.servers.get(name).map(|ip| SocketAddr::new(*ip, self.backend_port))
	}

	/// True if any configured deny rule actually inspects the body, i.e.
	/// the worker must buffer the request body before deny evaluation
	/// rather than streaming it straight through.
	pub fn needs_body_buffering(&self) -> bool {
		self.deny_rules.iter().any(|r| !r.body_regex_is_trivial)
	}
}

pub fn load_from_file(path: &str) -> Result<Config, ConfigError> {
	let ini = match Ini::load_from_file(path) {
		Ok(ini) => ini,
		Err(ini::Error::Io(source)) => {
			return Err(ConfigError::Io {
				path: path.to_string(),
				source,
			});
		},
		Err(source @ ini::Error::Parse(_)) => {
			return Err(ConfigError::Parse {
				path: path.to_string(),
				source,
			});
		},
	};
	build(&ini)
}

pub fn load_from_str(text: &str) -> Result<Config, ConfigError> {
	let ini = Ini::load_from_str(text).map_err(|source| ConfigError::Parse {
		path: "<inline>".to_string(),
		source: ini::Error::Parse(source),
	})?;
	build(&ini)
}

fn section_get<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
	ini.section(Some(section)).and_then(|s| s.get(key))
}

fn required<'a>(ini: &'a Ini, section: &str, key: &str) -> Result<&'a str, ConfigError> {
	section_get(ini, section, key).ok_or_else(|| ConfigError::MissingKey {
		section: section.to_string(),
		key: key.to_string(),
	})
}

fn parse_value<T: std::str::FromStr>(ini: &Ini, section: &str, key: &str, default: T) -> Result<T, ConfigError> {
	match section_get(ini, section, key) {
		None => Ok(default),
		Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
			section: section.to_string(),
			key: key.to_string(),
			reason: format!("could not parse {raw:?}"),
		}),
	}
}

fn build(ini: &Ini) -> Result<Config, ConfigError> {
	let bind_addr_raw = section_get(ini, "proxy", "bind_addr").unwrap_or("0.0.0.0");
	let bind_addr: IpAddr = bind_addr_raw.parse().map_err(|source| ConfigError::BadServerAddress {
		name: "bind_addr".to_string(),
		addr: bind_addr_raw.to_string(),
		source,
	})?;
	let bind_port = parse_value(ini, "proxy", "bind_port", DEFAULT_BIND_PORT)?;

	let backend_user = required(ini, "proxy", "backend_user")?.to_string();
	let backend_password = required(ini, "proxy", "backend_password")?.to_string();
	let backend_port = parse_value(ini, "proxy", "backend_port", DEFAULT_BACKEND_PORT)?;

	let default_server_name = section_get(ini, "proxy", "default_server_name").map(str::to_string);

	let backlog = parse_value(ini, "proxy", "backlog", 128u32)?;
	let server_recvbuf = parse_value(ini, "proxy", "server_recvbuf", 65536usize)?;
	let client_recvbuf = parse_value(ini, "proxy", "client_recvbuf", 65536usize)?;
	let open_file_limit = parse_value(ini, "proxy", "open_file_limit", 4096u64)?;
	let inactivity_timeout_secs = parse_value(ini, "proxy", "inactivity_timeout_secs", 120u64)?;

	let auth_whitelist = match section_get(ini, "proxy", "auth_whitelist") {
		None => Vec::new(),
		Some(raw) => raw
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(parse_whitelist_entry)
			.collect::<Result<Vec<_>, _>>()?,
	};
	let auth_header_name = section_get(ini, "proxy", "auth_header_name")
		.unwrap_or(DEFAULT_AUTH_HEADER)
		.to_string();
	let real_ip_header_name = section_get(ini, "proxy", "real_ip_header_name")
		.unwrap_or(DEFAULT_REAL_IP_HEADER)
		.to_string();
	let allow_any_user = parse_value(ini, "proxy", "allow_any_user", false)?;
	let deny_body_match_ceiling = parse_value(ini, "proxy", "deny_body_match_ceiling", DEFAULT_BODY_MATCH_CEILING)?;
	let project_filter_body_ceiling =
		parse_value(ini, "proxy", "project_filter_body_ceiling", DEFAULT_BODY_MATCH_CEILING)?;
	let log_level = section_get(ini, "proxy", "log_level").unwrap_or("INFO").to_string();

	let mut servers = HashMap::new();
	if let Some(section) = ini.section(Some("servers")) {
		for (name, addr) in section.iter() {
			let ip: IpAddr = addr.parse().map_err(|source| ConfigError::BadServerAddress {
				name: name.to_string(),
				addr: addr.to_string(),
				source,
			})?;
			servers.insert(name.to_string(), ip);
		}
	}

	let mut users = HashMap::new();
	if let Some(section) = ini.section(Some("users")) {
		for (name, password) in section.iter() {
			users.insert(name.to_string(), password.to_string());
		}
	}

	let mappings = parse_two_field_section(ini, "mapping", &servers, |id, server_name| {
		if !servers.contains_key(server_name) {
			return Err(ConfigError::UndefinedServer {
				id: id.to_string(),
				server: server_name.to_string(),
			});
		}
		Ok(())
	})?
	.into_iter()
	.map(|(id, user_regex, server_name)| {
		Ok(MappingRule {
			id,
			user_regex,
			server_name,
		})
	})
	.collect::<Result<Vec<_>, ConfigError>>()?;

	let project_filters = parse_two_field_section(ini, "project-filter", &servers, |_, _| Ok(()))?
		.into_iter()
		.map(|(id, user_regex, project_pattern)| {
			let project_regex = compile_regex("project-filter", &id, &project_pattern)?;
			Ok(ProjectFilterRule {
				id,
				user_regex,
				project_regex,
			})
		})
		.collect::<Result<Vec<_>, ConfigError>>()?;

	let deny_rules = parse_deny_section(ini)?;

	if let Some(name) = &default_server_name
		&& !servers.contains_key(name)
	{
		return Err(ConfigError::UndefinedDefaultServer(name.clone()));
	}

	Ok(Config {
		bind_addr,
		bind_port,
		backend_user,
		backend_password,
		backend_port,
		default_server_name,
		backlog,
		server_recvbuf,
		client_recvbuf,
		open_file_limit,
		inactivity_timeout: Duration::from_secs(inactivity_timeout_secs),
		auth_whitelist,
		auth_header_name,
		real_ip_header_name,
		allow_any_user,
		servers,
		users,
		mappings,
		project_filters,
		deny_rules,
		deny_body_match_ceiling,
		project_filter_body_ceiling,
		log_level,
	})
}

fn parse_whitelist_entry(raw: &str) -> Result<IpNet, ConfigError> {
	if let Ok(net) = raw.parse::<IpNet>() {
		return Ok(net);
	}
	raw
		.parse::<IpAddr>()
		.map(|ip| IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 }).expect("host prefix is always valid"))
		.map_err(|_| ConfigError::InvalidValue {
			section: "proxy".to_string(),
			key: "auth_whitelist".to_string(),
			reason: format!("{raw:?} is not an IP literal or CIDR"),
		})
}

/// Parses a `<id>="<a>":"<b>"` line from a two-field regex section
/// (`[mapping]`, `[project-filter]`) into `(id, compiled_first_regex,
/// second_field_raw)`. The caller compiles/validates the second field
/// since its meaning differs (server name vs. regex pattern).
fn parse_two_field_section(
	ini: &Ini,
	section: &str,
	_servers: &HashMap<String, IpAddr>,
	validate_second: impl Fn(&str, &str) -> Result<(), ConfigError>,
) -> Result<Vec<(String, Regex, String)>, ConfigError> {
	let Some(props) = ini.section(Some(section)) else {
		return Ok(Vec::new());
	};
	let mut out = Vec::new();
	for (id, raw) in props.iter() {
		let fields = split_quoted_fields(raw);
		if fields.len() != 2 {
			return Err(ConfigError::MalformedDenyRule {
				id: id.to_string(),
				field: "expected exactly two \"...\":\"...\" fields",
			});
		}
		validate_second(id, &fields[1])?;
		let user_regex = compile_regex(section, id, &fields[0])?;
		out.push((id.to_string(), user_regex, fields[1].clone()));
	}
	Ok(out)
}

fn parse_deny_section(ini: &Ini) -> Result<Vec<DenyRule>, ConfigError> {
	let Some(props) = ini.section(Some("deny")) else {
		return Ok(Vec::new());
	};
	let mut out = Vec::new();
	for (id, raw) in props.iter() {
		let fields = split_quoted_fields(raw);
		if fields.len() != 5 {
			return Err(ConfigError::MalformedDenyRule {
				id: id.to_string(),
				field: "expected exactly five \"...\" fields (user, method, url, header, body)",
			});
		}
		let user_regex = compile_regex("deny", id, &fields[0])?;
		let method_regex = compile_regex("deny", id, &fields[1])?;
		let url_regex = compile_regex("deny", id, &fields[2])?;
		let header_regex = compile_regex("deny", id, &fields[3])?;
		let body_regex_is_trivial = fields[4].is_empty();
		let body_regex = compile_regex("deny", id, &fields[4])?;
		out.push(DenyRule {
			id: id.to_string(),
			user_regex,
			method_regex,
			url_regex,
			header_regex,
			body_regex,
			body_regex_is_trivial,
		});
	}
	Ok(out)
}

/// Splits `"re1":"re2":"re3"` into its component patterns. Fields are
/// delimited by their own quotes, not by the `:` separators between
/// them, so a pattern may itself contain a literal `:` (routine for the
/// deny header-regex, which matches a rendered `Name: value` line).
/// Anything between a closing quote and the next opening quote — the
/// separating `:` and any whitespace — is ignored. Embedded escaped
/// quotes are not supported; the reference config format never needs
/// them.
fn split_quoted_fields(raw: &str) -> Vec<String> {
	let mut fields = Vec::new();
	let mut chars = raw.trim().chars().peekable();
	while let Some(&c) = chars.peek() {
		if c != '"' {
			chars.next();
			continue;
		}
		chars.next();
		let mut field = String::new();
		for ch in chars.by_ref() {
			if ch == '"' {
				break;
			}
			field.push(ch);
		}
		fields.push(field);
	}
	fields
}

/// An empty pattern matches anything (§4.3); compile it as such rather
/// than special-casing empty strings at every call site.
fn compile_regex(section: &str, id: &str, pattern: &str) -> Result<Regex, ConfigError> {
	let effective = if pattern.is_empty() { ".*" } else { pattern };
	Regex::new(effective).map_err(|source| ConfigError::BadRegex {
		section: section.to_string(),
		id: id.to_string(),
		source,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
[proxy]
bind_addr=0.0.0.0
bind_port=14080
backend_user=admin
backend_password=password
backend_port=3080
default_server_name=gns3-1
auth_whitelist=10.0.0.0/24

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

	#[test]
	fn loads_full_sample() {
		let cfg = load_from_str(SAMPLE).unwrap();
		assert_eq!(cfg.backend_port, 3080);
		assert_eq!(cfg.users.get("alice"), Some(&"wonder".to_string()));
		assert_eq!(cfg.mappings.len(), 1);
		assert_eq!(cfg.mappings[0].server_name, "gns3-1");
		assert!(cfg.mappings[0].user_regex.is_match("alice"));
		assert_eq!(cfg.deny_rules.len(), 1);
		assert!(cfg.deny_rules[0].body_regex_is_trivial);
		assert!(!cfg.needs_body_buffering());
		assert_eq!(cfg.auth_whitelist.len(), 1);
	}

	#[test]
	fn rejects_mapping_to_undefined_server() {
		let text = SAMPLE.replace(r#"m1="alice":"gns3-1""#, r#"m1="alice":"nope""#);
		let err = load_from_str(&text).unwrap_err();
		assert!(matches!(err, ConfigError::UndefinedServer { .. }));
	}

	#[test]
	fn rejects_undefined_default_server() {
		let text = SAMPLE.replace("default_server_name=gns3-1", "default_server_name=ghost");
		let err = load_from_str(&text).unwrap_err();
		assert!(matches!(err, ConfigError::UndefinedDefaultServer(_)));
	}

	#[test]
	fn empty_deny_field_matches_anything() {
		let cfg = load_from_str(SAMPLE).unwrap();
		let rule = &cfg.deny_rules[0];
		assert!(rule.url_regex.is_match("/v2/anything"));
		assert!(rule.header_regex.is_match(""));
	}

	#[test]
	fn non_trivial_body_regex_requires_buffering() {
		let text = SAMPLE.replace(r#"r1="alice":"DELETE":"":"":""#, r#"r1="alice":"DELETE":"":"":"secret""#);
		let cfg = load_from_str(&text).unwrap();
		assert!(cfg.needs_body_buffering());
	}

	#[test]
	fn deny_header_regex_may_contain_a_literal_colon() {
		let text = SAMPLE.replace(
			r#"r1="alice":"DELETE":"":"":""#,
			r#"r1="alice":"":"":"X-Forwarded-For:.*":""#,
		);
		let cfg = load_from_str(&text).unwrap();
		let rule = &cfg.deny_rules[0];
		assert!(rule.header_regex.is_match("X-Forwarded-For: 10.0.0.1"));
		assert!(!rule.header_regex.is_match("Host: x"));
	}

	#[test]
	fn split_quoted_fields_ignores_colons_inside_quotes() {
		let fields = split_quoted_fields(r#""alice":"":"":"X-Forwarded-For:.*":""#);
		assert_eq!(fields, vec!["alice", "", "", "X-Forwarded-For:.*", ""]);
	}
}
