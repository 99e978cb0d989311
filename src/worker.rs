//! Per-connection state machine (§4.4): ACCEPT → READ_REQUEST_HEAD →
//! AUTHORIZE → DIAL_BACKEND → FORWARD_REQUEST → TUNNEL_OR_FILTER → CLOSE.
//!
//! One task per accepted connection (§5); the task owns its client socket
//! for its whole lifetime and dials a fresh backend socket per request
//! rather than pooling backend connections across a kept-alive client
//! connection (a documented simplification, see DESIGN.md).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agent_core::copy::{ConnectionResult, copy_bidirectional};

use crate::access_log::{self, AccessLogEntry, Disposition};
use crate::config::Config;
use crate::error::{AuthError, ConnectionError, PolicyError};
use crate::filter;
use crate::http::message::{HeaderList, RequestHead, ResponseHead, minimal_response};
use crate::http::parser::{ChunkedScanner, Framing, HeadParser, HeadProgress, framing_for};
use crate::metrics::Metrics;
use crate::policy::{AuthContext, PolicyEngine};

const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 8 * 1024;

pub async fn handle_connection(mut client: TcpStream, peer: SocketAddr, config: Arc<Config>, metrics: Arc<Metrics>, shutdown: CancellationToken) {
	let peer_ip = peer.ip();
	let mut pending: Vec<u8> = Vec::new();

	loop {
		if shutdown.is_cancelled() {
			break;
		}
		match handle_one_request(&mut client, peer_ip, &config, &metrics, &mut pending).await {
			RequestOutcome::KeepAlive => continue,
			RequestOutcome::Close => break,
		}
	}
}

enum RequestOutcome {
	KeepAlive,
	Close,
}

async fn handle_one_request(
	client: &mut TcpStream,
	peer_ip: std::net::IpAddr,
	config: &Config,
	metrics: &Metrics,
	pending: &mut Vec<u8>,
) -> RequestOutcome {
	let start = Instant::now();

	let (head, leftover) = match read_request_head(client, std::mem::take(pending)).await {
		Ok(Some(parsed)) => parsed,
		Ok(None) => return RequestOutcome::Close, // clean EOF, nothing partial received
		Err(HeadReadError::ClientAbort) => {
			access_log::record(&AccessLogEntry {
				peer_ip,
				username: None,
				method: "-",
				target: "-",
				backend_name: None,
				status: None,
				response_bytes: 0,
				duration: start.elapsed(),
				disposition: Disposition::ClientAbort,
				deny_rule_id: None,
			});
			return RequestOutcome::Close;
		},
		Err(HeadReadError::Timeout) => return RequestOutcome::Close,
		Err(HeadReadError::Protocol(_)) => {
			let _ = client.write_all(&minimal_response(400, "Bad Request", &[], "malformed request\n")).await;
			access_log::record(&AccessLogEntry {
				peer_ip,
				username: None,
				method: "-",
				target: "-",
				backend_name: None,
				status: Some(400),
				response_bytes: 0,
				duration: start.elapsed(),
				disposition: Disposition::BadRequest,
				deny_rule_id: None,
			});
			return RequestOutcome::Close;
		},
		Err(HeadReadError::Io(e)) => {
			debug!(error = %e, "io error reading request head");
			return RequestOutcome::Close;
		},
	};

	let engine = PolicyEngine::new(config);
	let ctx = AuthContext {
		peer_ip,
		headers: &head.headers,
	};

	let username = match engine.authenticate(&ctx) {
		Ok(username) => username,
		Err(auth_err) => {
			let (status, body) = match auth_err {
				AuthError::Missing | AuthError::BadFormat => (401, "missing or malformed credentials\n"),
				AuthError::BadCredentials => (401, "invalid credentials\n"),
			};
			let extra = [("WWW-Authenticate", "Basic realm=\"GNS3\"")];
			let _ = client.write_all(&minimal_response(status, "Unauthorized", &extra, body)).await;
			access_log::record(&AccessLogEntry {
				peer_ip,
				username: None,
				method: &head.method,
				target: &head.target,
				backend_name: None,
				status: Some(status),
				response_bytes: 0,
				duration: start.elapsed(),
				disposition: Disposition::AuthFail,
				deny_rule_id: None,
			});
			return RequestOutcome::Close;
		},
	};

	let (backend_name, backend_addr) = match engine.resolve_backend(&username) {
		Ok(resolved) => resolved,
		Err(PolicyError::NoBackend) => {
			let _ = client.write_all(&minimal_response(502, "Bad Gateway", &[], "no backend for this user\n")).await;
			access_log::record(&AccessLogEntry {
				peer_ip,
				username: Some(&username),
				method: &head.method,
				target: &head.target,
				backend_name: None,
				status: Some(502),
				response_bytes: 0,
				duration: start.elapsed(),
				disposition: Disposition::NoBackend,
				deny_rule_id: None,
			});
			return RequestOutcome::Close;
		},
		Err(PolicyError::Denied(_)) => unreachable!("resolve_backend never returns Denied"),
	};

	let framing = match framing_for(&head.headers) {
		Ok(f) => f,
		Err(_) => {
			let _ = client.write_all(&minimal_response(400, "Bad Request", &[], "malformed framing headers\n")).await;
			return RequestOutcome::Close;
		},
	};

	let rendered_headers = head.headers.render_original();
	let mut reader = BodyReader::new(leftover);
	let mut cursor = BodyCursor::from_framing(framing);

	let deny_hit = if engine.needs_body_buffering() {
		let mut captured = Vec::new();
		if let Err(e) = pump_body(client, &mut reader, &mut cursor, None, Some(&mut captured), config.deny_body_match_ceiling).await {
			warn!(error = %e, "error buffering request body for deny evaluation");
			return RequestOutcome::Close;
		}
		let decoded = decode_body(framing, &captured);
		let as_text = String::from_utf8_lossy(&decoded);
		engine
			.first_matching_deny_rule(&username, &head.method, &head.target, &rendered_headers, Some(as_text.as_bytes()))
			.map(str::to_string)
	} else {
		engine
			.first_matching_deny_rule(&username, &head.method, &head.target, &rendered_headers, None)
			.map(str::to_string)
	};

	if let Some(rule_id) = deny_hit {
		let _ = client.write_all(&minimal_response(403, "Forbidden", &[], "denied by policy\n")).await;
		access_log::record(&AccessLogEntry {
			peer_ip,
			username: Some(&username),
			method: &head.method,
			target: &head.target,
			backend_name: Some(&backend_name),
			status: Some(403),
			response_bytes: 0,
			duration: start.elapsed(),
			disposition: Disposition::Deny,
			deny_rule_id: Some(&rule_id),
		});
		return RequestOutcome::Close;
	}

	let mut backend = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(backend_addr)).await {
		Ok(Ok(stream)) => stream,
		Ok(Err(source)) => {
			let _ = client.write_all(&minimal_response(502, "Bad Gateway", &[], "backend unreachable\n")).await;
			warn!(addr = %backend_addr, error = %source, "failed to dial backend");
			access_log::record(&AccessLogEntry {
				peer_ip,
				username: Some(&username),
				method: &head.method,
				target: &head.target,
				backend_name: Some(&backend_name),
				status: Some(502),
				response_bytes: 0,
				duration: start.elapsed(),
				disposition: Disposition::BackendUnreachable,
				deny_rule_id: None,
			});
			return RequestOutcome::Close;
		},
		Err(_) => {
			let _ = client.write_all(&minimal_response(504, "Gateway Timeout", &[], "backend dial timed out\n")).await;
			access_log::record(&AccessLogEntry {
				peer_ip,
				username: Some(&username),
				method: &head.method,
				target: &head.target,
				backend_name: Some(&backend_name),
				status: Some(504),
				response_bytes: 0,
				duration: start.elapsed(),
				disposition: Disposition::BackendUnreachable,
				deny_rule_id: None,
			});
			return RequestOutcome::Close;
		},
	};

	let mut forward_head = head.clone();
	rewrite_request_for_backend(&mut forward_head, backend_addr, &engine.backend_credentials_header(), framing);

	let mut out = Vec::new();
	forward_head.write_to(&mut out);
	if let Err(e) = backend.write_all(&out).await {
		warn!(error = %e, "failed writing request head to backend");
		return RequestOutcome::Close;
	}

	let request_body_bytes = match pump_body(client, &mut reader, &mut cursor, Some(&mut backend), None, u64::MAX).await {
		Ok(bytes) => bytes,
		Err(e) => {
			warn!(error = %e, "error forwarding request body to backend");
			access_log::record(&AccessLogEntry {
				peer_ip,
				username: Some(&username),
				method: &head.method,
				target: &head.target,
				backend_name: Some(&backend_name),
				status: None,
				response_bytes: 0,
				duration: start.elapsed(),
				disposition: Disposition::ClientAbort,
				deny_rule_id: None,
			});
			return RequestOutcome::Close;
		},
	};

	let needs_filter = head.is_get() && head.path().ends_with("/projects");
	let project_regex = if needs_filter { engine.project_filter_for(&username).cloned() } else { None };

	let outcome = forward_response(
		client,
		&mut backend,
		config,
		metrics,
		peer_ip,
		&username,
		&head,
		&backend_name,
		start,
		project_regex.as_ref(),
		request_body_bytes,
	)
	.await;

	*pending = reader.take_pending();
	outcome
}

/// Rewrites the parts of the request head the backend must see
/// differently from what the client sent (§4.4).
fn rewrite_request_for_backend(head: &mut RequestHead, backend_addr: SocketAddr, backend_creds_header: &str, framing: Framing) {
	head.headers.set("Authorization", backend_creds_header);
	head.headers.set("Host", format!("{}:{}", backend_addr.ip(), backend_addr.port()));
	if matches!(framing, Framing::Chunked) {
		head.headers.remove("Content-Length");
	}
	if head.headers.get("Expect").map(|v| v.eq_ignore_ascii_case("100-continue")).unwrap_or(false) {
		head.headers.remove("Expect");
	}
}

enum HeadReadError {
	Timeout,
	ClientAbort,
	Protocol(crate::error::ProtocolError),
	Io(std::io::Error),
}

/// Reads from `client` (seeded with any bytes already buffered from a
/// previous pipelined request) until a full request head is parsed.
/// Returns `Ok(None)` on a clean EOF with nothing ever received — the
/// ordinary way a kept-alive connection ends.
async fn read_request_head(client: &mut TcpStream, seed: Vec<u8>) -> Result<Option<(RequestHead, Vec<u8>)>, HeadReadError> {
	let mut parser = HeadParser::new();
	let mut any_bytes = !seed.is_empty();
	parser.feed(&seed);

	let result = tokio::time::timeout(HEAD_READ_TIMEOUT, async {
		loop {
			match parser.poll_request() {
				Ok(HeadProgress::Complete { head, .. }) => return Ok((head, parser.take_leftover())),
				Ok(HeadProgress::NeedMore) => {},
				Err(e) => return Err(HeadReadError::Protocol(e)),
			}
			let mut buf = [0u8; READ_CHUNK];
			let n = client.read(&mut buf).await.map_err(HeadReadError::Io)?;
			if n == 0 {
				return if any_bytes {
					Err(HeadReadError::ClientAbort)
				} else {
					Err(HeadReadError::Io(std::io::ErrorKind::UnexpectedEof.into()))
				};
			}
			any_bytes = true;
			parser.feed(&buf[..n]);
		}
	})
	.await;

	match result {
		Ok(Ok(parsed)) => Ok(Some(parsed)),
		Ok(Err(HeadReadError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
		Ok(Err(e)) => Err(e),
		Err(_) => Err(HeadReadError::Timeout),
	}
}

/// Incrementally frees bytes already read into memory before falling
/// back to fresh socket reads. Works identically whether the underlying
/// stream is the client or the backend socket.
struct BodyReader {
	leftover: Vec<u8>,
}

impl BodyReader {
	fn new(leftover: Vec<u8>) -> Self {
		Self { leftover }
	}

	async fn next_chunk(&mut self, stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
		if !self.leftover.is_empty() {
			return Ok(std::mem::take(&mut self.leftover));
		}
		let mut buf = vec![0u8; READ_CHUNK];
		let n = stream.read(&mut buf).await?;
		buf.truncate(n);
		Ok(buf)
	}

	fn push_back(&mut self, bytes: Vec<u8>) {
		debug_assert!(self.leftover.is_empty());
		self.leftover = bytes;
	}

	fn take_pending(self) -> Vec<u8> {
		self.leftover
	}
}

enum BodyCursor {
	None,
	ContentLength(u64),
	Chunked(ChunkedScanner),
}

impl BodyCursor {
	fn from_framing(framing: Framing) -> Self {
		match framing {
			Framing::None => BodyCursor::None,
			Framing::ContentLength(n) => BodyCursor::ContentLength(n),
			Framing::Chunked => BodyCursor::Chunked(ChunkedScanner::new()),
		}
	}

	fn is_done(&self) -> bool {
		match self {
			BodyCursor::None => true,
			BodyCursor::ContentLength(remaining) => *remaining == 0,
			BodyCursor::Chunked(scanner) => scanner.is_done(),
		}
	}
}

/// Drives body bytes from `stream` through `reader`/`cursor`, optionally
/// writing them to `dst` (streaming) and/or accumulating them into
/// `capture` (for deny/filter buffering), up to `budget` bytes this call.
/// Bytes beyond the body's logical end that arrive in the same read (the
/// start of a pipelined next request) are pushed back onto `reader` for
/// the next caller.
///
/// Both `dst` and `capture` receive the raw wire bytes (chunk-size lines
/// and CRLFs included for chunked framing), not the decoded payload: `dst`
/// must preserve the original framing byte-for-byte, and `capture`'s
/// callers forward the very same bytes verbatim when they decide not to
/// rewrite the message (e.g. the project filter's ceiling-exceeded
/// passthrough). Callers that need the decoded content instead — the deny
/// body-regex, the project-list JSON parser — call `decode_body` on the
/// buffered result themselves.
/// Returns the number of raw body bytes processed (forwarded to `dst`
/// and/or appended to `capture`), so callers can fold body traffic into
/// their byte-count metrics without re-deriving it from `capture`/`dst`.
async fn pump_body(
	stream: &mut TcpStream,
	reader: &mut BodyReader,
	cursor: &mut BodyCursor,
	mut dst: Option<&mut TcpStream>,
	mut capture: Option<&mut Vec<u8>>,
	mut budget: u64,
) -> Result<u64, ConnectionError> {
	let mut total = 0u64;
	while !cursor.is_done() && budget > 0 {
		let chunk = reader.next_chunk(stream).await?;
		if chunk.is_empty() {
			return Err(ConnectionError::ClientAbort);
		}
		let room = budget.min(chunk.len() as u64) as usize;
		let slice = &chunk[..room];

		let consumed = match cursor {
			BodyCursor::None => 0,
			BodyCursor::ContentLength(remaining) => {
				let take = (*remaining).min(slice.len() as u64) as usize;
				*remaining -= take as u64;
				take
			},
			BodyCursor::Chunked(scanner) => {
				let (_, consumed) = scanner.feed(slice)?;
				consumed
			},
		};

		let raw_part = &chunk[..consumed];
		if let Some(buf) = capture.as_mut() {
			buf.extend_from_slice(raw_part);
		}
		if let Some(dst) = dst.as_mut() {
			dst.write_all(raw_part).await?;
		}
		total += consumed as u64;
		budget = budget.saturating_sub(consumed as u64);

		let leftover = chunk[consumed..].to_vec();
		if !leftover.is_empty() {
			reader.push_back(leftover);
			if matches!(cursor, BodyCursor::None) {
				break;
			}
		}
	}
	Ok(total)
}

/// Decodes a fully-buffered raw body per its wire framing (§4.2). For
/// `Framing::Chunked` the raw bytes still contain chunk-size lines and
/// CRLFs (`pump_body` never decodes in place); everything else is
/// identical to its raw form. Used wherever a buffered body's actual
/// content — not its wire encoding — is what matters: the deny
/// body-regex (§4.3) and the project-list JSON parser (§4.5).
fn decode_body(framing: Framing, raw: &[u8]) -> Vec<u8> {
	match framing {
		Framing::Chunked => {
			let mut scanner = ChunkedScanner::new();
			scanner.feed(raw).map(|(decoded, _)| decoded).unwrap_or_default()
		},
		Framing::None | Framing::ContentLength(_) => raw.to_vec(),
	}
}

#[allow(clippy::too_many_arguments)]
async fn forward_response(
	client: &mut TcpStream,
	backend: &mut TcpStream,
	config: &Config,
	metrics: &Metrics,
	peer_ip: std::net::IpAddr,
	username: &str,
	request_head: &RequestHead,
	backend_name: &str,
	start: Instant,
	project_regex: Option<&regex::Regex>,
	request_body_bytes: u64,
) -> RequestOutcome {
	let mut parser = HeadParser::new();
	let head = loop {
		match parser.poll_response() {
			Ok(HeadProgress::Complete { head, .. }) => break head,
			Ok(HeadProgress::NeedMore) => {},
			Err(_) => {
				let _ = client.write_all(&minimal_response(502, "Bad Gateway", &[], "malformed response\n")).await;
				return RequestOutcome::Close;
			},
		}
		let mut buf = [0u8; READ_CHUNK];
		match tokio::time::timeout(config.inactivity_timeout, backend.read(&mut buf)).await {
			Ok(Ok(0)) | Err(_) => {
				let _ = client.write_all(&minimal_response(504, "Gateway Timeout", &[], "no response from backend\n")).await;
				return RequestOutcome::Close;
			},
			Ok(Ok(n)) => parser.feed(&buf[..n]),
			Ok(Err(e)) => {
				warn!(error = %e, "error reading response head from backend");
				return RequestOutcome::Close;
			},
		}
	};
	let response_leftover = parser.take_leftover();

	if head.status == 101 {
		let mut out = Vec::new();
		head.write_to(&mut out);
		if client.write_all(&out).await.is_err() {
			return RequestOutcome::Close;
		}
		if !response_leftover.is_empty() && client.write_all(&response_leftover).await.is_err() {
			return RequestOutcome::Close;
		}
		let stats = ConnectionResult::new();
		return tunnel(client, backend, &stats, config.inactivity_timeout, peer_ip, username, request_head, backend_name, start, metrics, request_body_bytes).await;
	}

	let resp_framing = match framing_for(&head.headers) {
		Ok(f) => f,
		Err(_) => Framing::None,
	};
	let mut reader = BodyReader::new(response_leftover);
	let mut cursor = BodyCursor::from_framing(resp_framing);

	if let Some(project_regex) = project_regex
		&& head.status == 200
		&& head.is_json()
	{
		let ceiling = config.project_filter_body_ceiling;
		let mut body = Vec::new();
		if let Err(e) = pump_body(backend, &mut reader, &mut cursor, None, Some(&mut body), ceiling + 1).await {
			warn!(error = %e, "error buffering response body for project filter");
			return RequestOutcome::Close;
		}

		if body.len() as u64 > ceiling || !cursor.is_done() {
			warn!("project-list response exceeds buffering ceiling, passing through unfiltered");
			return send_and_relay(
				client,
				backend,
				&mut reader,
				&mut cursor,
				&head,
				Some(body),
				peer_ip,
				username,
				request_head,
				backend_name,
				start,
				metrics,
				request_body_bytes,
			)
			.await;
		}

		let decoded_body = decode_body(resp_framing, &body);
		let result = filter::filter_project_list(head.status, true, &decoded_body, project_regex);
		let mut rewritten = head.clone();
		rewritten.headers.remove("Transfer-Encoding");
		rewritten.headers.set("Content-Length", result.body.len().to_string());
		let mut out = Vec::new();
		rewritten.write_to(&mut out);
		out.extend_from_slice(&result.body);
		if client.write_all(&out).await.is_err() {
			return finish(
				peer_ip,
				username,
				request_head,
				backend_name,
				Some(head.status),
				request_body_bytes,
				out.len() as u64,
				start,
				Disposition::ClientAbort,
				None,
				metrics,
				RequestOutcome::Close,
			);
		}
		let _ = result.outcome; // always Rewritten here, kept for clarity at call sites
		return finish(
			peer_ip,
			username,
			request_head,
			backend_name,
			Some(head.status),
			request_body_bytes,
			out.len() as u64,
			start,
			Disposition::Ok,
			None,
			metrics,
			keep_alive_outcome(request_head, &head),
		);
	}

	send_and_relay(
		client,
		backend,
		&mut reader,
		&mut cursor,
		&head,
		None,
		peer_ip,
		username,
		request_head,
		backend_name,
		start,
		metrics,
		request_body_bytes,
	)
	.await
}

#[allow(clippy::too_many_arguments)]
async fn send_and_relay(
	client: &mut TcpStream,
	backend: &mut TcpStream,
	reader: &mut BodyReader,
	cursor: &mut BodyCursor,
	head: &ResponseHead,
	already_buffered: Option<Vec<u8>>,
	peer_ip: std::net::IpAddr,
	username: &str,
	request_head: &RequestHead,
	backend_name: &str,
	start: Instant,
	metrics: &Metrics,
	request_body_bytes: u64,
) -> RequestOutcome {
	let mut out = Vec::new();
	head.write_to(&mut out);
	let mut sent = out.len() as u64;
	if let Some(buffered) = &already_buffered {
		out.extend_from_slice(buffered);
	}
	if client.write_all(&out).await.is_err() {
		return finish(
			peer_ip,
			username,
			request_head,
			backend_name,
			Some(head.status),
			request_body_bytes,
			sent,
			start,
			Disposition::ClientAbort,
			None,
			metrics,
			RequestOutcome::Close,
		);
	}
	sent += already_buffered.map(|b| b.len() as u64).unwrap_or(0);

	match pump_body(backend, reader, cursor, Some(client), None, u64::MAX).await {
		Ok(relayed) => sent += relayed,
		Err(e) => {
			warn!(error = %e, "error relaying response body to client");
			return finish(
				peer_ip,
				username,
				request_head,
				backend_name,
				Some(head.status),
				request_body_bytes,
				sent,
				start,
				Disposition::ClientAbort,
				None,
				metrics,
				RequestOutcome::Close,
			);
		},
	}

	finish(
		peer_ip,
		username,
		request_head,
		backend_name,
		Some(head.status),
		request_body_bytes,
		sent,
		start,
		Disposition::Ok,
		None,
		metrics,
		keep_alive_outcome(request_head, head),
	)
}

fn keep_alive_outcome(request_head: &RequestHead, response_head: &ResponseHead) -> RequestOutcome {
	if request_head.keep_alive() && response_head.keep_alive() {
		RequestOutcome::KeepAlive
	} else {
		RequestOutcome::Close
	}
}

#[allow(clippy::too_many_arguments)]
fn finish(
	peer_ip: std::net::IpAddr,
	username: &str,
	request_head: &RequestHead,
	backend_name: &str,
	status: Option<u16>,
	request_bytes: u64,
	response_bytes: u64,
	start: Instant,
	disposition: Disposition,
	deny_rule_id: Option<&str>,
	metrics: &Metrics,
	outcome: RequestOutcome,
) -> RequestOutcome {
	metrics.record_request(&disposition.tag(deny_rule_id));
	metrics.record_bytes(backend_name, request_bytes, response_bytes);
	access_log::record(&AccessLogEntry {
		peer_ip,
		username: Some(username),
		method: &request_head.method,
		target: &request_head.target,
		backend_name: Some(backend_name),
		status,
		response_bytes,
		duration: start.elapsed(),
		disposition,
		deny_rule_id,
	});
	outcome
}

#[allow(clippy::too_many_arguments)]
async fn tunnel(
	client: &mut TcpStream,
	backend: &mut TcpStream,
	stats: &ConnectionResult,
	idle_timeout: Duration,
	peer_ip: std::net::IpAddr,
	username: &str,
	request_head: &RequestHead,
	backend_name: &str,
	start: Instant,
	metrics: &Metrics,
	request_body_bytes: u64,
) -> RequestOutcome {
	// `&mut TcpStream` satisfies `AsyncRead + AsyncWrite + Unpin` directly
	// (tokio blanket-impls both traits for `&mut T`), so the two sides can
	// be handed to `copy_bidirectional` as plain reborrows — no socket
	// duplication needed.
	let result = copy_bidirectional(client, backend, stats, idle_timeout).await;
	let (disposition, status) = match result {
		Ok(()) => (Disposition::Ok, None),
		Err(agent_core::copy::CopyError::IdleTimeout) => (Disposition::IdleTimeout, None),
		Err(_) => (Disposition::ClientAbort, None),
	};
	// `stats.received()` is bytes relayed downstream→upstream (client to
	// backend) after the upgrade; `request_body_bytes` covers the request
	// body sent before it, while still on the plain HTTP leg.
	metrics.record_bytes(backend_name, stats.received() + request_body_bytes, stats.sent());
	access_log::record(&AccessLogEntry {
		peer_ip,
		username: Some(username),
		method: &request_head.method,
		target: &request_head.target,
		backend_name: Some(backend_name),
		status,
		response_bytes: stats.sent(),
		duration: start.elapsed(),
		disposition,
		deny_rule_id: None,
	});
	RequestOutcome::Close
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rewrite_strips_expect_and_content_length_on_chunked() {
		let mut headers = HeaderList::new();
		headers.push("Authorization", "Basic old");
		headers.push("Host", "client-facing:80");
		headers.push("Expect", "100-continue");
		headers.push("Content-Length", "10");
		let mut head = RequestHead {
			method: "POST".into(),
			target: "/v2/projects".into(),
			version: crate::http::message::HttpVersion::Http11,
			headers,
		};
		rewrite_request_for_backend(&mut head, "127.0.0.1:3080".parse().unwrap(), "Basic new", Framing::Chunked);
		assert_eq!(head.headers.get("Authorization"), Some("Basic new"));
		assert_eq!(head.headers.get("Host"), Some("127.0.0.1:3080"));
		assert!(!head.headers.contains("Expect"));
		assert!(!head.headers.contains("Content-Length"));
	}

	#[test]
	fn body_cursor_content_length_done_at_zero() {
		let cursor = BodyCursor::ContentLength(0);
		assert!(cursor.is_done());
		let cursor = BodyCursor::ContentLength(5);
		assert!(!cursor.is_done());
	}

	/// Regression test: `pump_body` must forward and capture the *raw*
	/// chunk-framed wire bytes unchanged (so a ceiling-exceeded passthrough
	/// can re-emit exactly what it already buffered), while `decode_body`
	/// separately strips the chunk framing down to the actual payload for
	/// callers that need to inspect content (deny body-regex, project-list
	/// JSON parsing).
	#[tokio::test]
	async fn pump_body_forwards_raw_chunk_framing_and_decode_body_strips_it() {
		use tokio::net::TcpListener;

		let source_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let source_addr = source_listener.local_addr().unwrap();
		let dst_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let dst_addr = dst_listener.local_addr().unwrap();

		let mut source_writer = TcpStream::connect(source_addr).await.unwrap();
		let (mut source_reader, _) = source_listener.accept().await.unwrap();
		let mut dst_reader_peer = TcpStream::connect(dst_addr).await.unwrap();
		let (mut dst_writer, _) = dst_listener.accept().await.unwrap();

		let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n".to_vec();
		source_writer.write_all(&wire).await.unwrap();

		let mut reader = BodyReader::new(Vec::new());
		let mut cursor = BodyCursor::Chunked(ChunkedScanner::new());
		let mut captured = Vec::new();
		pump_body(&mut source_reader, &mut reader, &mut cursor, Some(&mut dst_writer), Some(&mut captured), u64::MAX)
			.await
			.unwrap();

		assert_eq!(captured, wire, "capture must hold the raw wire bytes, not the decoded payload");
		assert_eq!(decode_body(Framing::Chunked, &captured), b"hello world");

		dst_writer.shutdown().await.unwrap();
		let mut forwarded = Vec::new();
		dst_reader_peer.read_to_end(&mut forwarded).await.unwrap();
		assert_eq!(forwarded, wire);
	}

	#[tokio::test]
	async fn pump_body_returns_raw_bytes_processed() {
		use tokio::net::TcpListener;

		let source_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let source_addr = source_listener.local_addr().unwrap();
		let mut source_writer = TcpStream::connect(source_addr).await.unwrap();
		let (mut source_reader, _) = source_listener.accept().await.unwrap();

		let body = b"0123456789".to_vec();
		source_writer.write_all(&body).await.unwrap();

		let mut reader = BodyReader::new(Vec::new());
		let mut cursor = BodyCursor::ContentLength(body.len() as u64);
		let mut captured = Vec::new();
		let processed = pump_body(&mut source_reader, &mut reader, &mut cursor, None, Some(&mut captured), u64::MAX)
			.await
			.unwrap();

		assert_eq!(processed, body.len() as u64);
		assert_eq!(captured, body);
	}
}
