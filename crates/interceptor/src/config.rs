//! Engine configuration: a `RawConfig`/`Config` split, following the
//! teacher's `agentgateway::config` pattern — `RawConfig` is the
//! `serde`-deserialisable user-facing shape, `Config` is what the engine
//! actually runs with.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where the raw config bytes came from, mirroring the teacher's
/// `ConfigSource` enum (used so error messages and reload logic can refer
/// back to the origin).
#[derive(Clone, Debug)]
pub enum ConfigSource {
	File(PathBuf),
	Static(String),
}

impl Serialize for ConfigSource {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		match self {
			ConfigSource::File(p) => s.serialize_str(&p.display().to_string()),
			ConfigSource::Static(_) => s.serialize_str("<static>"),
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawHttp2Config {
	/// `true`, `false`, or `"fallback"` per §4.2 step 2.
	#[serde(default)]
	pub mode: Option<RawHttp2Mode>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RawHttp2Mode {
	True,
	False,
	Fallback,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Http2Mode {
	Disabled,
	#[default]
	Enabled,
	Fallback,
}

impl From<Option<RawHttp2Mode>> for Http2Mode {
	fn from(value: Option<RawHttp2Mode>) -> Self {
		match value {
			None => Http2Mode::Enabled,
			Some(RawHttp2Mode::True) => Http2Mode::Enabled,
			Some(RawHttp2Mode::False) => Http2Mode::Disabled,
			Some(RawHttp2Mode::Fallback) => Http2Mode::Fallback,
		}
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawCaConfig {
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
}

/// The user-facing, serde-deserialisable configuration document (YAML or
/// JSON). Every field is optional and defaulted in `Config::resolve`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
	pub bind_addr: Option<IpAddr>,
	pub port: Option<u16>,
	pub port_range: Option<(u16, u16)>,
	#[serde(default)]
	pub http2: RawHttp2Config,
	pub max_body_size: Option<usize>,
	pub ca: Option<RawCaConfig>,
	#[serde(default)]
	pub rule_parameters: HashMap<String, Value>,
	pub event_queue_capacity: Option<usize>,
	pub shutdown_grace_ms: Option<u64>,
	pub suggest_changes: Option<bool>,
}

impl RawConfig {
	pub fn parse_yaml(input: &str) -> Result<Self, serde_yaml::Error> {
		serde_yaml::from_str(input)
	}
}

/// The resolved configuration the engine runs with.
#[derive(Clone, Debug)]
pub struct Config {
	pub bind_addr: IpAddr,
	pub port: Option<u16>,
	pub port_range: Option<(u16, u16)>,
	pub http2: Http2Mode,
	pub max_body_size: usize,
	pub ca: Option<RawCaConfig>,
	pub rule_parameters: HashMap<String, Value>,
	pub event_queue_capacity: usize,
	pub shutdown_grace: Duration,
	pub suggest_changes: bool,
	pub source: Option<ConfigSource>,
}

pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

impl Default for Config {
	fn default() -> Self {
		Config {
			bind_addr: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
			port: None,
			port_range: None,
			http2: Http2Mode::Enabled,
			max_body_size: DEFAULT_MAX_BODY_SIZE,
			ca: None,
			rule_parameters: HashMap::new(),
			event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
			shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
			suggest_changes: true,
			source: None,
		}
	}
}

impl Config {
	pub fn resolve(raw: RawConfig, source: Option<ConfigSource>) -> Self {
		Config {
			bind_addr: raw
				.bind_addr
				.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
			port: raw.port,
			port_range: raw.port_range,
			http2: raw.http2.mode.into(),
			max_body_size: raw.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
			ca: raw.ca,
			rule_parameters: raw.rule_parameters,
			event_queue_capacity: raw
				.event_queue_capacity
				.unwrap_or(DEFAULT_EVENT_QUEUE_CAPACITY),
			shutdown_grace: raw
				.shutdown_grace_ms
				.map(Duration::from_millis)
				.unwrap_or(DEFAULT_SHUTDOWN_GRACE),
			suggest_changes: raw.suggest_changes.unwrap_or(true),
			source,
		}
	}

	pub fn from_yaml_file(path: PathBuf) -> anyhow::Result<Self> {
		let text = std::fs::read_to_string(&path)?;
		let raw = RawConfig::parse_yaml(&text)?;
		Ok(Self::resolve(raw, Some(ConfigSource::File(path))))
	}

	pub fn from_yaml_str(input: &str) -> anyhow::Result<Self> {
		let raw = RawConfig::parse_yaml(input)?;
		Ok(Self::resolve(raw, Some(ConfigSource::Static(input.to_string()))))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_sane() {
		let cfg = Config::resolve(RawConfig::default(), None);
		assert_eq!(cfg.max_body_size, DEFAULT_MAX_BODY_SIZE);
		assert_eq!(cfg.http2, Http2Mode::Enabled);
		assert_eq!(cfg.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
	}

	#[test]
	fn http2_mode_parses_from_yaml() {
		let raw: RawConfig = serde_yaml::from_str("http2:\n  mode: fallback\n").unwrap();
		let cfg = Config::resolve(raw, None);
		assert_eq!(cfg.http2, Http2Mode::Fallback);
	}

	#[test]
	fn unknown_field_is_rejected() {
		let err = RawConfig::parse_yaml("bogus_field: 1\n");
		assert!(err.is_err());
	}
}
