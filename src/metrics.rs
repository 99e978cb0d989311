// Copyright Istio Authors
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

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Creates a sub-registry so proxy metrics don't collide with anything a
/// future embedder registers under the same process.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("gns3_proxy")
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Disposition {
	pub tag: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabel {
	pub server: String,
}

pub struct Metrics {
	requests_total: Family<Disposition, Counter>,
	bytes_to_backend: Family<BackendLabel, Counter>,
	bytes_to_client: Family<BackendLabel, Counter>,
	connections_total: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests_total = Family::default();
		registry.register(
			"requests",
			"Completed requests by disposition tag",
			requests_total.clone(),
		);

		let bytes_to_backend = Family::default();
		registry.register(
			"bytes_to_backend",
			"Bytes forwarded from clients to a backend",
			bytes_to_backend.clone(),
		);

		let bytes_to_client = Family::default();
		registry.register(
			"bytes_to_client",
			"Bytes forwarded from a backend to clients",
			bytes_to_client.clone(),
		);

		let connections_total = Counter::default();
		registry.register("connections", "Accepted client connections", connections_total.clone());

		Self {
			requests_total,
			bytes_to_backend,
			bytes_to_client,
			connections_total,
		}
	}

	pub fn record_connection_accepted(&self) {
		self.connections_total.inc();
	}

	pub fn record_request(&self, disposition: &str) {
		self
			.requests_total
			.get_or_create(&Disposition { tag: disposition.to_string() })
			.inc();
	}

	pub fn record_bytes(&self, server: &str, to_backend: u64, to_client: u64) {
		let label = BackendLabel { server: server.to_string() };
		self.bytes_to_backend.get_or_create(&label).inc_by(to_backend);
		self.bytes_to_client.get_or_create(&label).inc_by(to_client);
	}
}

/// Renders the registry in the Prometheus text exposition format, for
/// whatever transport wires it up (out of scope for the core data plane).
pub fn encode_text(registry: &Registry) -> String {
	let mut buffer = String::new();
	encode(&mut buffer, registry).expect("encoding to a String cannot fail");
	buffer
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn records_and_encodes() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(sub_registry(&mut registry));
		metrics.record_connection_accepted();
		metrics.record_request("OK");
		metrics.record_bytes("gns3-1", 100, 200);

		let text = encode_text(&registry);
		assert!(text.contains("gns3_proxy_connections_total"));
		assert!(text.contains("gns3_proxy_requests_total"));
	}
}
