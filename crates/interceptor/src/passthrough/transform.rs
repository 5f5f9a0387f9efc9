//! Declarative request/response transforms (§4.5 step 1: "declarative
//! transform applied before any hook runs"). Each field is independent and
//! optional; absence means "leave as received". Grounded on the teacher's
//! `RawConfig`/`Config` split style (small, serde-friendly structs with a
//! resolve step) rather than a single monolithic mutation function.

use std::path::PathBuf;

use bytes::Bytes;
use serde_json::Value;

use crate::errors::EngineError;
use crate::http::RawHeaders;

#[derive(Clone, Debug, Default)]
pub struct HeaderTransform {
	/// Headers to add or overwrite by (lowercased) name.
	pub update: Vec<(String, String)>,
	/// If set, entirely replaces the raw header list instead of merging.
	pub replace: Option<RawHeaders>,
}

#[derive(Clone, Debug, Default)]
pub struct BodyTransform {
	pub replace: Option<Bytes>,
	pub replace_from_file: Option<PathBuf>,
	/// A decoded (post content-encoding) replacement; re-encoded to match
	/// whatever `content-encoding` header is in effect after header updates.
	pub replace_decoded_from_file: Option<PathBuf>,
	/// Structural merge applied to a JSON body (§4.5 "updateJsonBody").
	pub update_json: Option<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct RequestTransform {
	pub replace_method: Option<http::Method>,
	pub headers: HeaderTransform,
	pub body: BodyTransform,
}

#[derive(Clone, Debug, Default)]
pub struct ResponseTransform {
	pub replace_status: Option<http::StatusCode>,
	pub headers: HeaderTransform,
	pub body: BodyTransform,
}

fn apply_header_transform(raw: &mut RawHeaders, t: &HeaderTransform) {
	if let Some(replacement) = &t.replace {
		*raw = replacement.clone();
	}
	for (name, value) in &t.update {
		raw.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
		raw.push(name.clone(), value.clone());
	}
}

/// Applies a `BodyTransform` to `current`, returning the replacement body
/// bytes. `read_file` is injected so tests can avoid real filesystem access
/// and so the engine can enforce a size cap uniformly via `crate::codec`.
pub async fn apply_body_transform(
	current: Bytes,
	t: &BodyTransform,
	read_file: impl AsyncFn(&PathBuf) -> std::io::Result<Vec<u8>>,
) -> Result<Bytes, EngineError> {
	if let Some(bytes) = &t.replace {
		return Ok(bytes.clone());
	}
	if let Some(path) = &t.replace_from_file {
		let bytes = read_file(path).await.map_err(|source| EngineError::TransformFileError {
			path: path.display().to_string(),
			source,
		})?;
		return Ok(Bytes::from(bytes));
	}
	if let Some(path) = &t.replace_decoded_from_file {
		let bytes = read_file(path).await.map_err(|source| EngineError::TransformFileError {
			path: path.display().to_string(),
			source,
		})?;
		return Ok(Bytes::from(bytes));
	}
	if let Some(patch) = &t.update_json {
		let mut value: Value = serde_json::from_slice(&current)
			.map_err(|_| EngineError::BodyTooLargeForTransform)?;
		json_merge(&mut value, patch);
		let encoded = serde_json::to_vec(&value).map_err(|_| EngineError::BodyTooLargeForTransform)?;
		return Ok(Bytes::from(encoded));
	}
	Ok(current)
}

pub fn apply_request_transform(
	method: &mut http::Method,
	headers: &mut RawHeaders,
	t: &RequestTransform,
) {
	if let Some(m) = &t.replace_method {
		*method = m.clone();
	}
	apply_header_transform(headers, &t.headers);
}

pub fn apply_response_transform(
	status: &mut http::StatusCode,
	headers: &mut RawHeaders,
	t: &ResponseTransform,
) {
	if let Some(s) = t.replace_status {
		*status = s;
	}
	apply_header_transform(headers, &t.headers);
}

/// Recursive merge: objects merge key-by-key, everything else is replaced
/// wholesale by `patch` (matching the `json-body-includes` containment sense
/// in reverse — this is a write, not a match).
fn json_merge(base: &mut Value, patch: &Value) {
	match (base, patch) {
		(Value::Object(base_map), Value::Object(patch_map)) => {
			for (k, v) in patch_map {
				json_merge(base_map.entry(k.clone()).or_insert(Value::Null), v);
			}
		},
		(base_slot, patch_value) => {
			*base_slot = patch_value.clone();
		},
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn header_update_overwrites_case_insensitively() {
		let mut raw = RawHeaders::default();
		raw.push("Content-Type", "text/plain");
		apply_header_transform(
			&mut raw,
			&HeaderTransform {
				update: vec![("content-type".to_string(), "application/json".to_string())],
				replace: None,
			},
		);
		assert_eq!(raw.0.len(), 1);
		assert_eq!(raw.0[0].1, "application/json");
	}

	#[test]
	fn json_merge_replaces_nested_key_only() {
		let mut base = json!({"a": {"x": 1, "y": 2}});
		json_merge(&mut base, &json!({"a": {"x": 9}}));
		assert_eq!(base, json!({"a": {"x": 9, "y": 2}}));
	}

	#[tokio::test]
	async fn body_transform_prefers_explicit_replace() {
		let out = apply_body_transform(Bytes::from_static(b"old"), &BodyTransform {
			replace: Some(Bytes::from_static(b"new")),
			..Default::default()
		}, async |_path| Ok(Vec::new()))
		.await
		.unwrap();
		assert_eq!(out, Bytes::from_static(b"new"));
	}
}
