//! Project-list response filter (§4.5). Runs only when the worker has
//! already determined the request is `GET .../projects` with a matching
//! project filter for the authenticated user.

use regex::Regex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
	/// Response passed through with no rewrite (wrong status/content-type,
	/// over the buffering ceiling, or an unrecognized JSON shape).
	PassThrough,
	/// Body was rewritten; caller must replace Content-Length and drop
	/// any Transfer-Encoding: chunked header.
	Rewritten,
}

#[derive(Debug)]
pub struct FilterResult {
	pub outcome: FilterOutcome,
	pub body: Vec<u8>,
}

/// Applies the project-name regex to a buffered JSON response body.
/// `content_type` and `status` gate whether filtering is attempted at
/// all; everything else about the response (headers other than
/// Content-Length/Transfer-Encoding) is left untouched by the caller.
pub fn filter_project_list(status: u16, is_json: bool, body: &[u8], project_regex: &Regex) -> FilterResult {
	if status != 200 || !is_json {
		return FilterResult {
			outcome: FilterOutcome::PassThrough,
			body: body.to_vec(),
		};
	}

	let parsed: Result<serde_json::Value, _> = serde_json::from_slice(body);
	let Ok(serde_json::Value::Array(items)) = parsed else {
		warn!("project-list response is not a JSON array, passing through unfiltered");
		return FilterResult {
			outcome: FilterOutcome::PassThrough,
			body: body.to_vec(),
		};
	};

	if !items.iter().all(|item| item.get("name").and_then(|n| n.as_str()).is_some()) {
		warn!("project-list entries missing a string \"name\" field, passing through unfiltered");
		return FilterResult {
			outcome: FilterOutcome::PassThrough,
			body: body.to_vec(),
		};
	}

	let filtered: Vec<serde_json::Value> = items
		.into_iter()
		.filter(|item| {
			item
				.get("name")
				.and_then(|n| n.as_str())
				.map(|name| project_regex.is_match(name))
				.unwrap_or(false)
		})
		.collect();

	let rewritten = serde_json::to_vec(&serde_json::Value::Array(filtered)).expect("serializing a Vec<Value> cannot fail");
	FilterResult {
		outcome: FilterOutcome::Rewritten,
		body: rewritten,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keeps_only_matching_projects_in_order() {
		let re = Regex::new("(.*)Group1(.*)").unwrap();
		let body = br#"[{"name":"ProjectGroup1A"},{"name":"ProjectGroup2B"},{"name":"XGroup1Y"}]"#;
		let result = filter_project_list(200, true, body, &re);
		assert_eq!(result.outcome, FilterOutcome::Rewritten);
		let value: serde_json::Value = serde_json::from_slice(&result.body).unwrap();
		let names: Vec<&str> = value.as_array().unwrap().iter().map(|v| v["name"].as_str().unwrap()).collect();
		assert_eq!(names, vec!["ProjectGroup1A", "XGroup1Y"]);
	}

	#[test]
	fn non_200_passes_through() {
		let re = Regex::new(".*").unwrap();
		let body = br#"[{"name":"x"}]"#;
		let result = filter_project_list(404, true, body, &re);
		assert_eq!(result.outcome, FilterOutcome::PassThrough);
		assert_eq!(result.body, body);
	}

	#[test]
	fn non_json_content_type_passes_through() {
		let re = Regex::new(".*").unwrap();
		let body = b"plain text";
		let result = filter_project_list(200, false, body, &re);
		assert_eq!(result.outcome, FilterOutcome::PassThrough);
	}

	#[test]
	fn non_array_shape_passes_through_with_warning() {
		let re = Regex::new(".*").unwrap();
		let body = br#"{"error":"oops"}"#;
		let result = filter_project_list(200, true, body, &re);
		assert_eq!(result.outcome, FilterOutcome::PassThrough);
		assert_eq!(result.body, body);
	}

	#[test]
	fn entries_missing_name_pass_through() {
		let re = Regex::new(".*").unwrap();
		let body = br#"[{"id":1}]"#;
		let result = filter_project_list(200, true, body, &re);
		assert_eq!(result.outcome, FilterOutcome::PassThrough);
	}
}
