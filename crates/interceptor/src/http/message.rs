//! Request/response records (§3 "Data Model"). The defining constraint here
//! is §9's "Raw header order": headers must round-trip in the exact case and
//! order they arrived in, which rules out `http::HeaderMap` as the primary
//! representation (it lowercases and reorders by name). We keep an ordered
//! `Vec<(String, String)>` of the wire-exact pairs alongside a lowercased
//! multi-map for matcher lookups.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use uuid::Uuid;

use crate::http::body::Body;

/// `rawHeaders`: the ordered, case-preserved `(name, value)` pairs exactly as
/// they arrived on the wire.
#[derive(Clone, Debug, Default)]
pub struct RawHeaders(pub Vec<(String, String)>);

impl RawHeaders {
	pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.push((name.into(), value.into()));
	}

	/// A lowercased, multi-valued view for case-insensitive lookups (the
	/// `headers` field in §3, as distinct from `rawHeaders`).
	pub fn lowercased(&self) -> HashMap<String, Vec<String>> {
		let mut out: HashMap<String, Vec<String>> = HashMap::new();
		for (name, value) in &self.0 {
			out.entry(name.to_ascii_lowercase()).or_default().push(value.clone());
		}
		out
	}

	pub fn get_first(&self, name: &str) -> Option<&str> {
		self
			.0
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	/// Concatenating every pair through `:` reproduces the original wire
	/// bytes modulo whitespace folding (§8 invariant).
	pub fn to_wire_string(&self) -> String {
		self
			.0
			.iter()
			.map(|(n, v)| format!("{n}: {v}\r\n"))
			.collect::<String>()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
	Http,
	Https,
	Ws,
	Wss,
}

impl Protocol {
	pub fn as_str(self) -> &'static str {
		match self {
			Protocol::Http => "http",
			Protocol::Https => "https",
			Protocol::Ws => "ws",
			Protocol::Wss => "wss",
		}
	}

	pub fn is_tls(self) -> bool {
		matches!(self, Protocol::Https | Protocol::Wss)
	}
}

#[derive(Clone, Debug)]
pub struct Destination {
	pub hostname: String,
	pub port: u16,
}

/// `timingEvents`: named epoch timestamps (§3).
#[derive(Clone, Debug, Default)]
pub struct TimingEvents {
	pub start_time: Option<SystemTime>,
	pub body_received_time: Option<SystemTime>,
	pub headers_sent_time: Option<SystemTime>,
	pub response_sent_time: Option<SystemTime>,
	pub aborted_time: Option<SystemTime>,
}

/// The immutable request record, once fully received (§3).
pub struct RequestRecord {
	pub id: Uuid,
	pub protocol: Protocol,
	pub http_version: http::Version,
	pub method: http::Method,
	pub url: url::Url,
	pub path: String,
	pub raw_headers: RawHeaders,
	pub destination: Destination,
	pub remote_addr: SocketAddr,
	pub body: Body,
	pub raw_trailers: RawHeaders,
	pub timing: TimingEvents,
	pub tags: Vec<String>,
	pub matched_rule_id: Option<Uuid>,
}

impl RequestRecord {
	pub fn headers(&self) -> HashMap<String, Vec<String>> {
		self.raw_headers.lowercased()
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.raw_headers.get_first(name)
	}
}

pub struct ResponseRecord {
	pub status: http::StatusCode,
	pub status_message: Option<String>,
	pub raw_headers: RawHeaders,
	pub body: Body,
	pub raw_trailers: RawHeaders,
	pub timing: TimingEvents,
	pub tags: Vec<String>,
}

impl ResponseRecord {
	pub fn headers(&self) -> HashMap<String, Vec<String>> {
		self.raw_headers.lowercased()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn raw_headers_round_trip_through_colon_concat() {
		let mut raw = RawHeaders::default();
		raw.push("Host", "example.com");
		raw.push("X-Foo", "bar");
		assert_eq!(raw.to_wire_string(), "Host: example.com\r\nX-Foo: bar\r\n");
	}

	#[test]
	fn lowercased_view_merges_case_variants() {
		let mut raw = RawHeaders::default();
		raw.push("X-Foo", "1");
		raw.push("x-foo", "2");
		let lower = raw.lowercased();
		assert_eq!(lower.get("x-foo").unwrap(), &vec!["1".to_string(), "2".to_string()]);
	}

	#[test]
	fn get_first_is_case_insensitive() {
		let mut raw = RawHeaders::default();
		raw.push("Content-Type", "text/plain");
		assert_eq!(raw.get_first("content-type"), Some("text/plain"));
	}
}
