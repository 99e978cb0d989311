//! Error taxonomy (§7). Config and bind errors are fatal to the process;
//! everything else is connection-local and is translated by the worker into
//! an HTTP response plus exactly one access-log line.

use std::net::AddrParseError;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse ini syntax in {path}: {source}")]
	Parse {
		path: String,
		#[source]
		source: ini::Error,
	},
	#[error("missing required key [{section}] {key}")]
	MissingKey { section: String, key: String },
	#[error("invalid value for [{section}] {key}: {reason}")]
	InvalidValue {
		section: String,
		key: String,
		reason: String,
	},
	#[error("mapping rule {id} refers to undefined server {server}")]
	UndefinedServer { id: String, server: String },
	#[error("default_server_name {0} is not defined in [servers]")]
	UndefinedDefaultServer(String),
	#[error("failed to compile regex in {section}.{id}: {source}")]
	BadRegex {
		section: String,
		id: String,
		#[source]
		source: regex::Error,
	},
	#[error("deny rule {id} is missing field {field}")]
	MalformedDenyRule { id: String, field: &'static str },
	#[error("server address {name} ({addr}) is not a valid IP/host: {source}")]
	BadServerAddress {
		name: String,
		addr: String,
		#[source]
		source: AddrParseError,
	},
}

#[derive(thiserror::Error, Debug)]
pub enum BindError {
	#[error("failed to bind {addr}: {source}")]
	Bind {
		addr: std::net::SocketAddr,
		#[source]
		source: std::io::Error,
	},
}

/// Malformed HTTP on the wire (§4.2). Always fatal to the connection.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
	#[error("malformed start line")]
	MalformedStartLine,
	#[error("header line exceeds 8 KiB")]
	HeaderTooLarge,
	#[error("malformed chunked encoding")]
	BadChunk,
}

/// Authentication/authorization outcomes (§4.3, §7).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("no credentials supplied")]
	Missing,
	#[error("authorization header is not valid basic auth")]
	BadFormat,
	#[error("credentials did not match")]
	BadCredentials,
}

/// Backend selection failures (§4.3).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
	#[error("no mapping or default server resolved a backend for this user")]
	NoBackend,
	#[error("denied by rule {0}")]
	Denied(String),
}

/// Everything that can go wrong once a connection is in flight, collapsed
/// into the single type the worker's state machine propagates with `?`.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
	#[error("protocol error: {0}")]
	Protocol(#[from] ProtocolError),
	#[error("auth error: {0}")]
	Auth(#[from] AuthError),
	#[error("policy error: {0}")]
	Policy(#[from] PolicyError),
	#[error("failed to dial backend {addr}: {source}")]
	Dial {
		addr: std::net::SocketAddr,
		#[source]
		source: std::io::Error,
	},
	#[error("backend dial timed out after {0:?}")]
	DialTimeout(std::time::Duration),
	#[error("client closed the connection")]
	ClientAbort,
	#[error("connection idle for longer than the inactivity timeout")]
	IdleTimeout,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}
