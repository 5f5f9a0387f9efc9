//! Matchers (§3 "Matcher", §9 "tagged variants not class hierarchies").
//! Implemented as one sum type with a per-kind `matches` arm rather than a
//! trait-object hierarchy, following the teacher's preference for enums over
//! `dyn` dispatch at rule-evaluation seams (see `rules/engine.rs` for the
//! per-request dispatch loop this feeds).
//!
//! `callback` is the one variant that can't be a pure function: §9 notes
//! that hooks/callbacks are RPC proxies materialised by an external admin
//! layer. From the engine's side that's just an async predicate, so it's
//! modelled as a boxed `Fn` returning a future.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::http::RequestRecord;

pub type CallbackMatcher =
	Arc<dyn Fn(&RequestRecord) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send>> + Send + Sync>;

#[derive(Clone)]
pub enum Matcher {
	Method(http::Method),
	Host(String),
	Hostname(String),
	Port(u16),
	Protocol(crate::http::Protocol),
	PathExact(String),
	PathRegex(Regex),
	UrlExact(String),
	UrlRegex(Regex),
	QueryExact(Vec<(String, String)>),
	QueryIncludes(Vec<(String, String)>),
	HeaderIncludes(String, String),
	HeaderMatches(String, Regex),
	BodyIncludes(String),
	BodyMatchesRegex(Regex),
	JsonBodyExact(Value),
	JsonBodyIncludes(Value),
	FormIncludes(Vec<(String, String)>),
	Cookie(String, String),
	RawBodyRegex(regex::bytes::Regex),
	MultipartIncludes(Vec<String>),
	/// Runs last within a rule's matcher list (§4.3 step 1): a callback
	/// raising an error aborts matching entirely rather than counting as a
	/// miss.
	Callback(CallbackMatcher),
}

impl std::fmt::Debug for Matcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.kind())
	}
}

impl Matcher {
	pub fn kind(&self) -> &'static str {
		match self {
			Matcher::Method(_) => "method",
			Matcher::Host(_) => "host",
			Matcher::Hostname(_) => "hostname",
			Matcher::Port(_) => "port",
			Matcher::Protocol(_) => "protocol",
			Matcher::PathExact(_) => "path-exact",
			Matcher::PathRegex(_) => "path-regex",
			Matcher::UrlExact(_) => "url-exact",
			Matcher::UrlRegex(_) => "url-regex",
			Matcher::QueryExact(_) => "query-exact",
			Matcher::QueryIncludes(_) => "query-includes",
			Matcher::HeaderIncludes(..) => "header-includes",
			Matcher::HeaderMatches(..) => "header-matches",
			Matcher::BodyIncludes(_) => "body-includes",
			Matcher::BodyMatchesRegex(_) => "body-matches-regex",
			Matcher::JsonBodyExact(_) => "json-body-exact",
			Matcher::JsonBodyIncludes(_) => "json-body-includes",
			Matcher::FormIncludes(_) => "form-includes",
			Matcher::Cookie(..) => "cookie",
			Matcher::RawBodyRegex(_) => "raw-body-regex",
			Matcher::MultipartIncludes(_) => "multipart-includes",
			Matcher::Callback(_) => "callback",
		}
	}

	/// Whether evaluating this matcher needs the decoded body (so the engine
	/// knows to peek it before calling `matches`).
	pub fn needs_body(&self) -> bool {
		matches!(
			self,
			Matcher::BodyIncludes(_)
				| Matcher::BodyMatchesRegex(_)
				| Matcher::JsonBodyExact(_)
				| Matcher::JsonBodyIncludes(_)
				| Matcher::FormIncludes(_)
				| Matcher::RawBodyRegex(_)
				| Matcher::MultipartIncludes(_)
		)
	}

	/// `body` is `None` when the matcher doesn't need it, or when the cap in
	/// `maxBodySize` was hit (treated as a non-match, not an error).
	pub async fn matches(&self, req: &RequestRecord, body: Option<&[u8]>) -> anyhow::Result<bool> {
		Ok(match self {
			Matcher::Method(m) => &req.method == m,
			Matcher::Host(h) => req.url.host_str().map(|x| x.eq_ignore_ascii_case(h)).unwrap_or(false),
			Matcher::Hostname(h) => req.destination.hostname.eq_ignore_ascii_case(h),
			Matcher::Port(p) => req.destination.port == *p,
			Matcher::Protocol(p) => req.protocol == *p,
			Matcher::PathExact(p) => req.path == *p,
			Matcher::PathRegex(re) => re.is_match(&req.path),
			Matcher::UrlExact(u) => req.url.as_str() == u,
			Matcher::UrlRegex(re) => re.is_match(req.url.as_str()),
			Matcher::QueryExact(expected) => query_pairs(&req.url) == *expected,
			Matcher::QueryIncludes(expected) => {
				let actual = query_pairs(&req.url);
				expected.iter().all(|pair| actual.contains(pair))
			},
			Matcher::HeaderIncludes(name, value) => req
				.header(name)
				.map(|v| v.eq_ignore_ascii_case(value))
				.unwrap_or(false),
			Matcher::HeaderMatches(name, re) => req.header(name).map(|v| re.is_match(v)).unwrap_or(false),
			Matcher::BodyIncludes(needle) => body
				.map(|b| String::from_utf8_lossy(b).contains(needle.as_str()))
				.unwrap_or(false),
			Matcher::BodyMatchesRegex(re) => body
				.map(|b| re.is_match(&String::from_utf8_lossy(b)))
				.unwrap_or(false),
			Matcher::RawBodyRegex(re) => body.map(|b| re.is_match(b)).unwrap_or(false),
			Matcher::JsonBodyExact(expected) => body
				.and_then(|b| serde_json::from_slice::<Value>(b).ok())
				.map(|actual| &actual == expected)
				.unwrap_or(false),
			Matcher::JsonBodyIncludes(expected) => body
				.and_then(|b| serde_json::from_slice::<Value>(b).ok())
				.map(|actual| json_includes(&actual, expected))
				.unwrap_or(false),
			Matcher::FormIncludes(expected) => body
				.map(|b| {
					let parsed: HashMap<String, String> =
						url::form_urlencoded::parse(b).into_owned().collect();
					expected
						.iter()
						.all(|(k, v)| parsed.get(k).map(|av| av == v).unwrap_or(false))
				})
				.unwrap_or(false),
			Matcher::Cookie(name, value) => req
				.header("cookie")
				.map(|c| cookie_has(c, name, value))
				.unwrap_or(false),
			Matcher::MultipartIncludes(field_names) => body
				.map(|b| {
					let text = String::from_utf8_lossy(b);
					field_names
						.iter()
						.all(|name| text.contains(&format!("name=\"{name}\"")))
				})
				.unwrap_or(false),
			Matcher::Callback(f) => f(req).await?,
		})
	}
}

fn query_pairs(url: &url::Url) -> Vec<(String, String)> {
	url.query_pairs().into_owned().collect()
}

fn cookie_has(header: &str, name: &str, value: &str) -> bool {
	header.split(';').any(|kv| {
		let mut parts = kv.trim().splitn(2, '=');
		let k = parts.next().unwrap_or("");
		let v = parts.next().unwrap_or("");
		k == name && v == value
	})
}

/// Recursive "does `actual` contain at least these keys/values" check used by
/// `json-body-includes` — unlike `json-body-exact`, extra keys in `actual`
/// are fine.
fn json_includes(actual: &Value, expected: &Value) -> bool {
	match (actual, expected) {
		(Value::Object(a), Value::Object(e)) => e
			.iter()
			.all(|(k, v)| a.get(k).map(|av| json_includes(av, v)).unwrap_or(false)),
		(Value::Array(a), Value::Array(e)) => {
			e.len() == a.len() && e.iter().zip(a.iter()).all(|(ev, av)| json_includes(av, ev))
		},
		_ => actual == expected,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn json_includes_ignores_extra_keys() {
		let actual = json!({"a": 1, "b": 2});
		let expected = json!({"a": 1});
		assert!(json_includes(&actual, &expected));
	}

	#[test]
	fn json_includes_rejects_mismatched_value() {
		let actual = json!({"a": 1});
		let expected = json!({"a": 2});
		assert!(!json_includes(&actual, &expected));
	}

	#[test]
	fn cookie_has_finds_pair_among_several() {
		assert!(cookie_has("a=1; b=2; c=3", "b", "2"));
		assert!(!cookie_has("a=1; b=2", "b", "3"));
	}
}
