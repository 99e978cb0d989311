//! Request/response head types. Headers are a flat, ordered list rather than
//! a map: forwarding must preserve multiple occurrences of a header in
//! their original order, with case-preserving-but-case-insensitive lookup,
//! which a `HashMap<String, Vec<String>>` makes awkward to get right.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
	Http10,
	Http11,
}

impl HttpVersion {
	pub fn as_str(&self) -> &'static str {
		match self {
			HttpVersion::Http10 => "HTTP/1.0",
			HttpVersion::Http11 => "HTTP/1.1",
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
	pub fn new() -> Self {
		Self(Vec::new())
	}

	pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.push((name.into(), value.into()));
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// First value for `name`, case-insensitive.
	pub fn get(&self, name: &str) -> Option<&str> {
		self
			.0
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn contains(&self, name: &str) -> bool {
		self.get(name).is_some()
	}

	/// Replace all occurrences of `name` with a single new value, preserving
	/// the position of the first occurrence (or appending if absent).
	pub fn set(&mut self, name: &str, value: impl Into<String>) {
		let value = value.into();
		let mut replaced = false;
		self.0.retain_mut(|(k, v)| {
			if k.eq_ignore_ascii_case(name) {
				if !replaced {
					*v = value.clone();
					replaced = true;
					true
				} else {
					false
				}
			} else {
				true
			}
		});
		if !replaced {
			self.0.push((name.to_string(), value));
		}
	}

	pub fn remove(&mut self, name: &str) {
		self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
	}

	/// Renders the header block back to bytes in original order, the form
	/// the deny engine's header-regex matches against (§4.3).
	pub fn render_original(&self) -> String {
		let mut out = String::new();
		for (k, v) in &self.0 {
			out.push_str(k);
			out.push_str(": ");
			out.push_str(v);
			out.push_str("\r\n");
		}
		out
	}

	pub fn write_to(&self, out: &mut Vec<u8>) {
		for (k, v) in &self.0 {
			out.extend_from_slice(k.as_bytes());
			out.extend_from_slice(b": ");
			out.extend_from_slice(v.as_bytes());
			out.extend_from_slice(b"\r\n");
		}
	}
}

#[derive(Debug, Clone)]
pub struct RequestHead {
	pub method: String,
	/// Opaque to the proxy; never rewritten (§4.2). Empty target is
	/// normalized to "/" (§4.4 tie-break).
	pub target: String,
	pub version: HttpVersion,
	pub headers: HeaderList,
}

impl RequestHead {
	pub fn path(&self) -> &str {
		self.target.split(['?', '#']).next().unwrap_or("")
	}

	pub fn is_get(&self) -> bool {
		self.method.eq_ignore_ascii_case("GET")
	}

	pub fn keep_alive(&self) -> bool {
		match self.headers.get("Connection") {
			Some(v) if v.eq_ignore_ascii_case("close") => false,
			Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
			_ => matches!(self.version, HttpVersion::Http11),
		}
	}

	pub fn write_to(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(self.method.as_bytes());
		out.push(b' ');
		out.extend_from_slice(self.target.as_bytes());
		out.push(b' ');
		out.extend_from_slice(self.version.as_str().as_bytes());
		out.extend_from_slice(b"\r\n");
		self.headers.write_to(out);
		out.extend_from_slice(b"\r\n");
	}
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
	pub version: HttpVersion,
	pub status: u16,
	pub reason: String,
	pub headers: HeaderList,
}

impl ResponseHead {
	pub fn keep_alive(&self) -> bool {
		match self.headers.get("Connection") {
			Some(v) if v.eq_ignore_ascii_case("close") => false,
			Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
			_ => matches!(self.version, HttpVersion::Http11),
		}
	}

	pub fn is_json(&self) -> bool {
		self
			.headers
			.get("Content-Type")
			.map(|v| v.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case("application/json"))
			.unwrap_or(false)
	}

	pub fn write_to(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(self.version.as_str().as_bytes());
		out.push(b' ');
		out.extend_from_slice(self.status.to_string().as_bytes());
		out.push(b' ');
		out.extend_from_slice(self.reason.as_bytes());
		out.extend_from_slice(b"\r\n");
		self.headers.write_to(out);
		out.extend_from_slice(b"\r\n");
	}
}

/// Builds a minimal, self-contained error response (§7). Used both for
/// client-fault (400), auth-fault (401/403), and gateway-fault (502/504)
/// replies, since the proxy never has a real backend response to relay in
/// those cases.
pub fn minimal_response(status: u16, reason: &str, extra_headers: &[(&str, &str)], body: &str) -> Vec<u8> {
	let mut out = Vec::new();
	out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
	out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
	out.extend_from_slice(b"Content-Type: text/plain\r\n");
	out.extend_from_slice(b"Connection: close\r\n");
	for (k, v) in extra_headers {
		out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
	}
	out.extend_from_slice(b"\r\n");
	out.extend_from_slice(body.as_bytes());
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_list_preserves_order_and_duplicates() {
		let mut h = HeaderList::new();
		h.push("Sec-WebSocket-Protocol", "chat");
		h.push("Sec-WebSocket-Protocol", "json");
		h.push("Host", "example.com");
		let rendered: Vec<_> = h.iter().collect();
		assert_eq!(
			rendered,
			vec![
				("Sec-WebSocket-Protocol", "chat"),
				("Sec-WebSocket-Protocol", "json"),
				("Host", "example.com"),
			]
		);
	}

	#[test]
	fn get_is_case_insensitive() {
		let mut h = HeaderList::new();
		h.push("Content-Type", "application/json");
		assert_eq!(h.get("content-type"), Some("application/json"));
	}

	#[test]
	fn set_replaces_first_and_drops_rest() {
		let mut h = HeaderList::new();
		h.push("Authorization", "Basic old");
		h.push("Host", "x");
		h.set("authorization", "Basic new");
		assert_eq!(h.get("Authorization"), Some("Basic new"));
		assert_eq!(h.iter().filter(|(k, _)| k.eq_ignore_ascii_case("authorization")).count(), 1);
	}
}
