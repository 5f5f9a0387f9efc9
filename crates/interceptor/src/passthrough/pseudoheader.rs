//! HTTP/2 pseudoheader rewrites (§9 "HTTP/2 pseudoheader rewrites"). A single
//! truth table drives both directions: translating an HTTP/1.1 request line
//! into `:method`/`:scheme`/`:authority`/`:path` when forwarding over h2, and
//! stripping pseudoheaders back out when downgrading an h2 response to
//! HTTP/1.1 for the client. Kept as one function per direction so the engine
//! never has to special-case protocol pairs inline.

use http::{HeaderValue, Method, Uri, Version};

use crate::errors::EngineError;
use crate::http::RawHeaders;

/// Builds the pseudoheader set for an outbound HTTP/2 request. Fails if the
/// caller already set one of these explicitly (§9: "Cannot set custom :x
/// pseudoheader values" is a hard error, not a silent override).
pub fn request_pseudoheaders(
	method: &Method,
	uri: &Uri,
	authority: &str,
	raw_headers: &RawHeaders,
) -> Result<Vec<(&'static str, String)>, EngineError> {
	for (name, _) in &raw_headers.0 {
		if name.starts_with(':') {
			let bare = name.trim_start_matches(':');
			return Err(EngineError::InvalidOverride(leak_name(bare)));
		}
	}
	let path = uri
		.path_and_query()
		.map(|pq| pq.as_str().to_string())
		.unwrap_or_else(|| "/".to_string());
	Ok(vec![
		(":method", method.as_str().to_string()),
		(":scheme", "https".to_string()),
		(":authority", authority.to_string()),
		(":path", path),
	])
}

/// Strips h2 pseudoheaders from a response being translated down to
/// HTTP/1.1/1.0 for the client; `:status` is consumed into the status line
/// rather than forwarded as a header.
pub fn strip_response_pseudoheaders(raw_headers: &mut RawHeaders) {
	raw_headers.0.retain(|(name, _)| !name.starts_with(':'));
}

/// Whether `version` needs pseudoheaders synthesised for its wire form.
pub fn uses_pseudoheaders(version: Version) -> bool {
	matches!(version, Version::HTTP_2 | Version::HTTP_3)
}

fn leak_name(s: &str) -> &'static str {
	match s {
		"method" => "method",
		"scheme" => "scheme",
		"authority" => "authority",
		"path" => "path",
		"status" => "status",
		_ => "unknown",
	}
}

pub fn authority_from_headers(raw_headers: &RawHeaders, fallback: &str) -> String {
	raw_headers
		.get_first(":authority")
		.or_else(|| raw_headers.get_first("host"))
		.map(|s| s.to_string())
		.unwrap_or_else(|| fallback.to_string())
}

#[allow(dead_code)]
fn _assert_header_value_type(_: HeaderValue) {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_explicit_pseudoheader_override() {
		let mut headers = RawHeaders::default();
		headers.push(":method".to_string(), "GET".to_string());
		let result = request_pseudoheaders(
			&Method::GET,
			&Uri::from_static("/x"),
			"example.com",
			&headers,
		);
		assert!(result.is_err());
	}

	#[test]
	fn builds_expected_pseudoheader_set() {
		let headers = RawHeaders::default();
		let built =
			request_pseudoheaders(&Method::POST, &Uri::from_static("/a?b=1"), "example.com", &headers)
				.unwrap();
		assert!(built.contains(&(":method", "POST".to_string())));
		assert!(built.contains(&(":path", "/a?b=1".to_string())));
	}

	#[test]
	fn strip_removes_only_pseudoheaders() {
		let mut headers = RawHeaders::default();
		headers.push(":status".to_string(), "200".to_string());
		headers.push("content-type".to_string(), "text/plain".to_string());
		strip_response_pseudoheaders(&mut headers);
		assert_eq!(headers.0.len(), 1);
	}
}
