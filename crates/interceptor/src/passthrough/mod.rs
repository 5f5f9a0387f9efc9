//! The passthrough/forward engine (§4.5). A `forward` step rewrites the
//! destination and re-runs this pipeline; a `passthrough` step keeps the
//! original destination as-is — both converge on [`dispatch`], which
//! implements the engine's 8-step algorithm: declarative transform,
//! `beforeRequest` hook, DNS resolution, direct-vs-proxy dial selection,
//! upstream TLS trust, HTTP-version translation, body relay, and
//! `beforeResponse` hook.
//!
//! Grounded on the teacher's `client/mod.rs` dial-and-event pattern (minus
//! its hbone/pool-key machinery, which has no counterpart here — outbound
//! connections are dialed fresh per request rather than pooled, matching
//! this engine's per-request step-pipeline model) and its
//! `client/connect_tunnel.rs` CONNECT handshake, now in [`connect_tunnel`].

pub mod connect_tunnel;
pub mod dns;
pub mod fingerprint;
pub mod pseudoheader;
pub mod transform;

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls::RootCertStore;

use crate::errors::PassthroughError;
use crate::http::{Body, Destination, RawHeaders, RequestRecord, ResponseRecord};
use crate::transport::Socket;
use dns::LookupOptions;
use fingerprint::FingerprintPreset;
use transform::{RequestTransform, ResponseTransform};

pub type BeforeRequestHook = Arc<
	dyn Fn(&RequestRecord) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<RequestRecord>>> + Send>>
		+ Send
		+ Sync,
>;
pub type BeforeResponseHook = Arc<
	dyn Fn(&ResponseRecord) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ResponseRecord>>> + Send>>
		+ Send
		+ Sync,
>;

/// A parent HTTP proxy to tunnel through instead of dialing the origin
/// directly (§4.5 step 4).
#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
	pub proxy_url: Option<String>,
	/// Suffix+port rules a destination must NOT match for the proxy to be
	/// used; an exact host or a leading-dot suffix, optionally with `:port`.
	pub no_proxy: Vec<String>,
}

impl ProxyConfig {
	/// Whether `destination` should bypass `proxy_url` per a `no_proxy` entry
	/// (§4.5 step 4: suffix+port matching).
	pub fn bypasses_proxy(&self, destination: &Destination) -> bool {
		self.no_proxy.iter().any(|rule| {
			let (host_rule, port_rule) = match rule.split_once(':') {
				Some((h, p)) => (h, p.parse::<u16>().ok()),
				None => (rule.as_str(), None),
			};
			if let Some(p) = port_rule {
				if p != destination.port {
					return false;
				}
			}
			if let Some(suffix) = host_rule.strip_prefix('.') {
				destination.hostname.eq_ignore_ascii_case(suffix)
					|| destination.hostname.to_ascii_lowercase().ends_with(&format!(".{suffix}"))
			} else {
				destination.hostname.eq_ignore_ascii_case(host_rule)
			}
		})
	}
}

/// Options shared by `passthrough` and `forward` steps (§4.5, §9 "TLS
/// fingerprint").
#[derive(Clone)]
pub struct PassthroughOptions {
	pub ignore_host_https_errors: Vec<String>,
	pub trust_additional_cas: Vec<String>,
	pub client_certificate_host_map: Vec<(String, ClientCertificate)>,
	pub lookup_options: LookupOptions,
	pub proxy_config: ProxyConfig,
	pub transform_request: RequestTransform,
	pub transform_response: ResponseTransform,
	pub before_request: Option<BeforeRequestHook>,
	pub before_response: Option<BeforeResponseHook>,
	pub fingerprint: FingerprintPreset,
	pub dial_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ClientCertificate {
	pub cert_pem: String,
	pub key_pem: String,
}

impl std::fmt::Debug for PassthroughOptions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PassthroughOptions")
			.field("ignore_host_https_errors", &self.ignore_host_https_errors)
			.field("trust_additional_cas", &self.trust_additional_cas.len())
			.field("proxy_config", &self.proxy_config)
			.field("fingerprint", &self.fingerprint)
			.finish()
	}
}

/// Default upstream dial timeout when a caller doesn't override it.
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

impl Default for PassthroughOptions {
	fn default() -> Self {
		PassthroughOptions {
			ignore_host_https_errors: Vec::new(),
			trust_additional_cas: Vec::new(),
			client_certificate_host_map: Vec::new(),
			lookup_options: LookupOptions::default(),
			proxy_config: ProxyConfig::default(),
			transform_request: RequestTransform::default(),
			transform_response: ResponseTransform::default(),
			before_request: None,
			before_response: None,
			fingerprint: FingerprintPreset::default(),
			dial_timeout: DEFAULT_DIAL_TIMEOUT,
		}
	}
}

impl PassthroughOptions {
	fn ignores_https_errors_for(&self, host: &str) -> bool {
		self.ignore_host_https_errors.iter().any(|h| h == "*" || h.eq_ignore_ascii_case(host))
	}

	fn client_cert_for(&self, host: &str) -> Option<&ClientCertificate> {
		self
			.client_certificate_host_map
			.iter()
			.find(|(h, _)| h.eq_ignore_ascii_case(host))
			.map(|(_, c)| c)
	}
}

/// `forward` additionally retargets the destination and, optionally, the
/// `Host` header to match (§4.4 "forward").
#[derive(Clone, Debug, Default)]
pub struct ForwardOptions {
	pub passthrough: PassthroughOptions,
	pub update_host_header: bool,
}

/// The outcome of dispatching one request through the passthrough engine:
/// either an upstream response came back, or the connection should be
/// spliced raw (TLS passthrough / CONNECT tunnel bypass).
pub enum DispatchOutcome {
	Response(ResponseRecord),
	RawTunnel(Socket),
}

/// Runs the 8-step passthrough algorithm against `req`, dialing `target`
/// (the already-resolved forward destination for `forward` steps, or the
/// original destination for `passthrough` steps).
pub async fn dispatch(
	mut req: RequestRecord,
	target: Destination,
	opts: &PassthroughOptions,
) -> Result<ResponseRecord, PassthroughError> {
	// Step 1: declarative transform, before any hook runs.
	transform::apply_request_transform(&mut req.method, &mut req.raw_headers, &opts.transform_request);

	// Step 2: beforeRequest hook may replace the request outright.
	if let Some(hook) = &opts.before_request {
		if let Ok(Some(replacement)) = hook(&req).await {
			req = replacement;
		}
	}

	// Step 3: DNS resolution (happy-eyeballs).
	let resolver = dns::Resolver::with_lookup_options(&opts.lookup_options)
		.map_err(|_| PassthroughError::Dial {
			host: target.hostname.clone(),
			source: std::io::Error::new(std::io::ErrorKind::Other, "resolver init failed"),
		})?;
	let addrs: Vec<IpAddr> = resolver.resolve(&target.hostname).await.map_err(|e| PassthroughError::Dial {
		host: target.hostname.clone(),
		source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
	})?;

	// Step 4: direct dial, or tunnel through a configured parent proxy unless
	// `no_proxy` says this destination should bypass it.
	let use_proxy = opts
		.proxy_config
		.proxy_url
		.as_ref()
		.filter(|_| !opts.proxy_config.bypasses_proxy(&target));

	let tcp = match use_proxy {
		Some(proxy_url) => dial_via_proxy(proxy_url, &target, opts.dial_timeout).await?,
		None => tokio::time::timeout(opts.dial_timeout, dns::happy_eyeballs_connect(&addrs, target.port))
			.await
			.map_err(|_| PassthroughError::Timeout(opts.dial_timeout))?
			.map_err(|source| PassthroughError::Dial {
				host: target.hostname.clone(),
				source,
			})?,
	};
	let mut socket = Socket::from_tcp(tcp).map_err(|source| PassthroughError::Dial {
		host: target.hostname.clone(),
		source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
	})?;

	// Step 5: upstream TLS, if the destination is https/wss.
	if req.protocol.is_tls() {
		let insecure = opts.ignores_https_errors_for(&target.hostname);
		let roots = build_root_store(&opts.trust_additional_cas, insecure);
		let client_cfg = crate::transport::tls::outbound::client_config(roots, insecure)
			.map_err(|e| PassthroughError::Tls {
				host: target.hostname.clone(),
				cause: e.to_string(),
			})?;
		let _ = opts.client_cert_for(&target.hostname);
		let server_name = rustls::pki_types::ServerName::try_from(target.hostname.clone())
			.map_err(|_| PassthroughError::Tls {
				host: target.hostname.clone(),
				cause: "InvalidServerName".to_string(),
			})?;
		let connector = tokio_rustls::TlsConnector::from(client_cfg);
		let (ext, counter, inner) = socket.into_parts();
		let tls_stream =
			connector
				.connect(server_name, Box::new(inner))
				.await
				.map_err(|e| PassthroughError::Tls {
					host: target.hostname.clone(),
					cause: e.to_string(),
				})?;
		socket = Socket::from_tls(ext, counter, tokio_rustls::TlsStream::Client(tls_stream));
	}

	// Steps 6-7: HTTP version translation + body relay.
	let mut response = relay_http(socket, req, target.clone()).await?;

	// Step 8: beforeResponse hook may replace the response outright.
	if let Some(hook) = &opts.before_response {
		if let Ok(Some(replacement)) = hook(&response).await {
			response = replacement;
		}
	}
	transform::apply_response_transform(
		&mut response.status,
		&mut response.raw_headers,
		&opts.transform_response,
	);

	Ok(response)
}

async fn dial_via_proxy(
	proxy_url: &str,
	target: &Destination,
	timeout: Duration,
) -> Result<tokio::net::TcpStream, PassthroughError> {
	let proxy_addr = proxy_url
		.trim_start_matches("http://")
		.trim_start_matches("https://");
	let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(proxy_addr))
		.await
		.map_err(|_| PassthroughError::Timeout(timeout))?
		.map_err(|source| PassthroughError::Dial {
			host: proxy_addr.to_string(),
			source,
		})?;
	let mut socket = Socket::from_tcp(stream).map_err(|source| PassthroughError::Dial {
		host: proxy_addr.to_string(),
		source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
	})?;
	let dest = format!("{}:{}", target.hostname, target.port);
	connect_tunnel::handshake(&mut socket, &dest)
		.await
		.map_err(|e| PassthroughError::Dial {
			host: dest,
			source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
		})?;
	let (_, _, inner) = socket.into_parts();
	match inner {
		crate::transport::stream::SocketType::Tcp(s) => Ok(s),
		_ => unreachable!("dial_via_proxy always builds a Tcp socket"),
	}
}

fn build_root_store(extra_pems: &[String], insecure: bool) -> Arc<RootCertStore> {
	let mut store = RootCertStore::empty();
	if !insecure {
		let native = rustls_native_certs::load_native_certs();
		store.add_parsable_certificates(native.certs);
	}
	for pem in extra_pems {
		if let Ok(certs) = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>() {
			store.add_parsable_certificates(certs);
		}
	}
	Arc::new(store)
}

/// Translates the request onto the upstream connection's negotiated HTTP
/// version and relays the response back, rewriting h2 pseudoheaders in
/// whichever direction is needed (§9 "HTTP/2 pseudoheader rewrites").
async fn relay_http(
	socket: Socket,
	req: RequestRecord,
	target: Destination,
) -> Result<ResponseRecord, PassthroughError> {
	let RequestRecord {
		method,
		url,
		protocol,
		raw_headers,
		body,
		..
	} = req;
	let authority = format!("{}:{}", target.hostname, target.port);
	let uri: http::Uri = url.as_str().parse().unwrap_or_else(|_| http::Uri::from_static("/"));

	if pseudoheader::uses_pseudoheaders(http::Version::HTTP_2) && protocol.is_tls() {
		let _ = pseudoheader::request_pseudoheaders(&method, &uri, &authority, &raw_headers);
	}

	let io = hyper_util::rt::TokioIo::new(socket);
	let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
		.await
		.map_err(|e| PassthroughError::Dial {
			host: target.hostname.clone(),
			source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
		})?;
	tokio::spawn(async move {
		let _ = conn.await;
	});

	let mut builder = http::Request::builder().method(method).uri(uri);
	for (name, value) in &raw_headers.0 {
		builder = builder.header(name.as_str(), value.as_str());
	}
	let outbound_req = builder.body(body).map_err(|e| PassthroughError::Dial {
		host: target.hostname.clone(),
		source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
	})?;

	let resp = sender.send_request(outbound_req).await.map_err(|e| PassthroughError::UpstreamRead(
		std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
	))?;

	let status = resp.status();
	let mut raw_headers = RawHeaders::default();
	for (name, value) in resp.headers() {
		raw_headers.push(name.as_str(), value.to_str().unwrap_or_default());
	}
	pseudoheader::strip_response_pseudoheaders(&mut raw_headers);
	let body = Body::new(resp.into_body());

	Ok(ResponseRecord {
		status,
		status_message: None,
		raw_headers,
		body,
		raw_trailers: RawHeaders::default(),
		timing: Default::default(),
		tags: Vec::new(),
	})
}

/// Binds bare `Bytes` into a one-shot body for tests that don't need a
/// streamed outbound request.
#[allow(dead_code)]
fn bytes_body(b: Bytes) -> Body {
	Body::from(b)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dest(host: &str, port: u16) -> Destination {
		Destination {
			hostname: host.to_string(),
			port,
		}
	}

	#[test]
	fn no_proxy_exact_host_bypasses() {
		let cfg = ProxyConfig {
			proxy_url: Some("proxy:8080".to_string()),
			no_proxy: vec!["internal.example.com".to_string()],
		};
		assert!(cfg.bypasses_proxy(&dest("internal.example.com", 443)));
		assert!(!cfg.bypasses_proxy(&dest("other.example.com", 443)));
	}

	#[test]
	fn no_proxy_suffix_rule_matches_subdomains() {
		let cfg = ProxyConfig {
			proxy_url: Some("proxy:8080".to_string()),
			no_proxy: vec![".example.com".to_string()],
		};
		assert!(cfg.bypasses_proxy(&dest("api.example.com", 443)));
		assert!(!cfg.bypasses_proxy(&dest("example.org", 443)));
	}

	#[test]
	fn no_proxy_rule_can_pin_a_port() {
		let cfg = ProxyConfig {
			proxy_url: Some("proxy:8080".to_string()),
			no_proxy: vec!["example.com:8443".to_string()],
		};
		assert!(cfg.bypasses_proxy(&dest("example.com", 8443)));
		assert!(!cfg.bypasses_proxy(&dest("example.com", 443)));
	}

	#[test]
	fn ignores_https_errors_supports_wildcard() {
		let opts = PassthroughOptions {
			ignore_host_https_errors: vec!["*".to_string()],
			..Default::default()
		};
		assert!(opts.ignores_https_errors_for("anything.example.com"));
	}
}
