//! Connection acceptor (§4.2): TLS-vs-plaintext detection, `tlsPassthrough`
//! splicing, CONNECT/WebSocket-upgrade recursion, and HTTP request dispatch
//! into the rule engine. Grounded on the teacher's `proxy/gateway.rs`
//! accept-loop/auto-server pattern, trimmed to this engine's single-listener
//! session model: no drain crate, no multi-bind/thread-per-core pool, no
//! HBONE — one `JoinSet` tracks in-flight connections and a `watch` channel
//! signals shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ca::CertificateAuthority;
use crate::config::Http2Mode;
use crate::events::{Event, EventBus};
use crate::http::{Body, Destination, Protocol, RawHeaders, RequestRecord, ResponseRecord, TimingEvents};
use crate::rules::{RuleStore, Step, engine};
use crate::transport::sni::read_client_hello_prefix;
use crate::transport::stream::TlsConnectionInfo;
use crate::transport::{Extension, Socket};
use crate::websocket::{self, RejectResponse, WebsocketStep};

/// Per-session acceptor state (§3 "Session", §4.2).
pub struct Acceptor {
	pub ca: Arc<CertificateAuthority>,
	pub http_rules: Arc<RuleStore<Step>>,
	pub ws_rules: Arc<RuleStore<WebsocketStep>>,
	pub events: Arc<EventBus>,
	pub http2: Http2Mode,
	pub max_match_body_bytes: usize,
	/// SNI suffixes (leading `.` for subdomain-only) routed to raw TCP
	/// passthrough instead of TLS termination (§4.2 step 2).
	pub tls_passthrough: Vec<String>,
	pub suggest_changes: bool,
}

impl Acceptor {
	/// Accepts connections until `shutdown` fires, spawning one task per
	/// connection and waiting for in-flight tasks to finish before returning.
	pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<()>) {
		let mut tasks = JoinSet::new();
		loop {
			tokio::select! {
				biased;
				_ = shutdown.changed() => break,
				accepted = listener.accept() => {
					let Ok((stream, _peer)) = accepted else { continue };
					let acceptor = self.clone();
					tasks.spawn(async move {
						acceptor.handle_raw_connection(stream, None).await;
					});
				}
			}
		}
		debug!("accept loop received shutdown signal, draining in-flight connections");
		drop(listener);
		while tasks.join_next().await.is_some() {}
	}

	async fn handle_raw_connection(self: Arc<Self>, stream: TcpStream, default_destination: Option<Destination>) {
		match Socket::from_tcp(stream) {
			Ok(socket) => self.handle_connection(socket, default_destination).await,
			Err(e) => {
				warn!(error = %e, "failed to wrap accepted socket");
				self.events.publish(Event::ClientError { message: e.to_string() });
			},
		}
	}

	/// §4.2 steps 1-4. The CONNECT-tunnel case (step 3) recurses back into
	/// this function on the tunnelled stream via `handle_connect`, and a
	/// WebSocket upgrade similarly wraps the upgraded IO as a fresh `Socket`.
	async fn handle_connection(self: Arc<Self>, mut socket: Socket, default_destination: Option<Destination>) {
		let (prefix, sni) = match read_client_hello_prefix(&mut socket).await {
			Ok(result) => result,
			Err(e) => {
				self.events.publish(Event::ClientError { message: e.to_string() });
				return;
			},
		};
		let looks_like_tls = prefix.first() == Some(&0x16);
		let socket = socket.prepend(prefix);

		if looks_like_tls {
			if let Some(sni) = sni.filter(|s| self.sni_is_passthrough(s)) {
				self.splice_tls_passthrough(socket, sni).await;
				return;
			}
			self.terminate_tls_and_serve(socket, default_destination).await;
		} else {
			self.serve_http(socket, default_destination).await;
		}
	}

	fn sni_is_passthrough(&self, sni: &str) -> bool {
		self.tls_passthrough.iter().any(|suffix| suffix_matches(sni, suffix))
	}

	/// Splices the raw (still-encrypted) connection through to an upstream
	/// on port 443, never terminating TLS inside the proxy (§4.2 step 2).
	async fn splice_tls_passthrough(self: Arc<Self>, socket: Socket, sni: String) {
		self.events.publish(Event::TlsPassthroughOpened { sni: Some(sni.clone()) });
		match TcpStream::connect((sni.as_str(), 443)).await {
			Ok(mut upstream) => {
				let (_ext, _counter, mut inner) = socket.into_parts();
				let _ = tokio::io::copy_bidirectional(&mut inner, &mut upstream).await;
			},
			Err(e) => self.events.publish(Event::ClientError { message: e.to_string() }),
		}
		self.events.publish(Event::TlsPassthroughClosed { sni: Some(sni) });
	}

	async fn terminate_tls_and_serve(self: Arc<Self>, socket: Socket, default_destination: Option<Destination>) {
		match crate::transport::tls::accept(socket, &self.ca, self.http2).await {
			Ok(tls_socket) => self.serve_http(tls_socket, default_destination).await,
			Err(e) => {
				warn!(cause = %e.cause, sni = ?e.sni, "TLS handshake failed");
				self.events.publish(Event::TlsClientError {
					cause: e.cause.to_string(),
					sni: e.sni,
				});
			},
		}
	}

	/// Runs hyper's auto (HTTP/1 or HTTP/2) server loop over one accepted
	/// socket, routing every request through `route`.
	async fn serve_http(self: Arc<Self>, socket: Socket, default_destination: Option<Destination>) {
		let protocol = if socket.ext::<TlsConnectionInfo>().is_some() {
			Protocol::Https
		} else {
			Protocol::Http
		};
		let remote_addr = socket.tcp().peer_addr;
		let acceptor = self.clone();

		let service = service_fn(move |req: hyper::Request<Incoming>| {
			let acceptor = acceptor.clone();
			let default_destination = default_destination.clone();
			async move { acceptor.route(req, protocol, remote_addr, default_destination).await }
		});

		let io = TokioIo::new(socket);
		if let Err(e) = auto_server(self.http2).serve_connection_with_upgrades(io, service).await {
			self.events.publish(Event::ClientError { message: e.to_string() });
		}
	}

	/// Dispatch for one request on an already-accepted connection: CONNECT
	/// (§4.2 step 3), WebSocket upgrade (§4.6), or a normal rule-engine pass
	/// (§4.3).
	async fn route(
		self: Arc<Self>,
		req: hyper::Request<Incoming>,
		protocol: Protocol,
		remote_addr: SocketAddr,
		default_destination: Option<Destination>,
	) -> Result<hyper::Response<Body>, std::convert::Infallible> {
		if req.method() == http::Method::CONNECT {
			return Ok(self.handle_connect(req).await);
		}
		if is_websocket_upgrade(&req) {
			return Ok(self.handle_websocket_upgrade(req, remote_addr, default_destination).await);
		}

		match build_request_record(req, protocol, remote_addr, default_destination) {
			Ok(record) => Ok(self.dispatch_http(record).await),
			Err(resp) => Ok(resp),
		}
	}

	/// §4.2 step 3: reply `200 Connection Established`, then re-run the
	/// connection-acceptance algorithm over the tunnelled stream, remembering
	/// the CONNECT target as the default destination for origin-form
	/// requests that arrive inside it.
	async fn handle_connect(self: Arc<Self>, mut req: hyper::Request<Incoming>) -> hyper::Response<Body> {
		let target = req.uri().authority().map(|a| a.to_string()).or_else(|| {
			req
				.headers()
				.get(http::header::HOST)
				.and_then(|h| h.to_str().ok())
				.map(str::to_string)
		});

		let Some((host, port)) = target.as_deref().and_then(parse_host_port) else {
			return error_response(http::StatusCode::BAD_REQUEST, "CONNECT target missing host:port");
		};

		let on_upgrade = hyper::upgrade::on(&mut req);
		tokio::spawn(async move {
			match on_upgrade.await {
				Ok(upgraded) => {
					let socket = Socket::from_upgraded(Arc::new(Extension::new()), upgraded);
					let destination = Destination { hostname: host, port };
					self.handle_connection(socket, Some(destination)).await;
				},
				Err(e) => self.events.publish(Event::ClientError { message: e.to_string() }),
			}
		});

		hyper::Response::builder()
			.status(http::StatusCode::OK)
			.body(Body::empty())
			.unwrap_or_else(|_| error_response(http::StatusCode::INTERNAL_SERVER_ERROR, "connect"))
	}

	/// §4.6: match the upgrade request against the WebSocket rule list, then
	/// either reject with an HTTP response or accept and run the winning
	/// step once the upgrade completes.
	async fn handle_websocket_upgrade(
		self: Arc<Self>,
		mut req: hyper::Request<Incoming>,
		remote_addr: SocketAddr,
		default_destination: Option<Destination>,
	) -> hyper::Response<Body> {
		let Some(client_key) = req
			.headers()
			.get("sec-websocket-key")
			.and_then(|h| h.to_str().ok())
			.map(str::to_string)
		else {
			return error_response(http::StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
		};

		let protocol = Protocol::Ws;
		let mut record = match build_request_record_parts(&req, protocol, remote_addr, default_destination.clone()) {
			Ok(r) => r,
			Err(resp) => return resp,
		};

		let snapshot = self.ws_rules.snapshot();
		let rule = match engine::select(&snapshot, &mut record, self.max_match_body_bytes, self.suggest_changes).await
		{
			Ok(rule) => rule,
			Err(e) => return error_response(e.status(), &e.to_string()),
		};
		self.events.publish(Event::WebsocketRequest { request_id: record.id });

		let Some(step) = rule.steps.first() else {
			return error_response(http::StatusCode::INTERNAL_SERVER_ERROR, "websocket rule has no step");
		};

		if let WebsocketStep::Reject(reject) = step {
			return reject_to_response(reject);
		}

		let accept = websocket::accept_key(&client_key);
		let response = hyper::Response::builder()
			.status(http::StatusCode::SWITCHING_PROTOCOLS)
			.header(http::header::UPGRADE, "websocket")
			.header(http::header::CONNECTION, "Upgrade")
			.header("sec-websocket-accept", accept)
			.body(Body::empty())
			.unwrap_or_else(|_| error_response(http::StatusCode::INTERNAL_SERVER_ERROR, "upgrade"));

		let step = match step {
			WebsocketStep::Passthrough => WebsocketStep::Passthrough,
			WebsocketStep::Forward => WebsocketStep::Forward,
			WebsocketStep::Echo => WebsocketStep::Echo,
			WebsocketStep::Listen => WebsocketStep::Listen,
			WebsocketStep::Close => WebsocketStep::Close,
			WebsocketStep::Timeout => WebsocketStep::Timeout,
			WebsocketStep::Reject(_) => unreachable!("handled above"),
		};
		let destination = record.destination.clone();
		let request_id = record.id;
		let on_upgrade = hyper::upgrade::on(&mut req);
		let events = self.events.clone();
		tokio::spawn(async move {
			match on_upgrade.await {
				Ok(upgraded) => {
					events.publish(Event::WebsocketAccepted { request_id });
					let client = TokioIo::new(upgraded);
					run_websocket_step(step, client, destination).await;
				},
				Err(e) => events.publish(Event::ClientError { message: e.to_string() }),
			}
		});

		response
	}

	async fn dispatch_http(self: Arc<Self>, mut record: RequestRecord) -> hyper::Response<Body> {
		self.events.publish(Event::RequestInitiated {
			request_id: record.id,
			method: record.method.to_string(),
			url: record.url.to_string(),
		});
		let snapshot = self.http_rules.snapshot();
		let rule = match engine::select(
			&snapshot,
			&mut record,
			self.max_match_body_bytes,
			self.suggest_changes,
		)
		.await
		{
			Ok(rule) => rule,
			Err(e) => return error_response(e.status(), &e.to_string()),
		};
		let request_id = record.id;
		match engine::run(&rule, record).await {
			Ok(response) => {
				self.events.publish(Event::Response {
					request_id,
					status: response.status.as_u16(),
					tags: response.tags.clone(),
				});
				response_record_to_hyper(response)
			},
			Err(e) => {
				self.events.publish(Event::Abort {
					request_id,
					reason: e.to_string(),
				});
				error_response(e.status(), &e.to_string())
			},
		}
	}
}

/// §4.2 step 2's ALPN selection and h2 enablement, mirrored into the
/// hyper-util `auto::Builder` the teacher's own `auto_server()` returns.
fn auto_server(http2: Http2Mode) -> auto::Builder<TokioExecutor> {
	let mut builder = auto::Builder::new(TokioExecutor::new());
	if http2 != Http2Mode::Disabled {
		builder.http2().timer(TokioTimer::new());
	}
	builder
}

fn is_websocket_upgrade(req: &hyper::Request<Incoming>) -> bool {
	let upgrade_hdr = req
		.headers()
		.get(http::header::UPGRADE)
		.and_then(|h| h.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("websocket"))
		.unwrap_or(false);
	let connection_hdr = req
		.headers()
		.get(http::header::CONNECTION)
		.and_then(|h| h.to_str().ok())
		.map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
		.unwrap_or(false);
	upgrade_hdr && connection_hdr && req.headers().contains_key("sec-websocket-key")
}

fn reject_to_response(reject: &RejectResponse) -> hyper::Response<Body> {
	let mut builder = hyper::Response::builder().status(reject.status);
	for (name, value) in &reject.headers.0 {
		builder = builder.header(name.as_str(), value.as_str());
	}
	builder
		.body(Body::from(reject.body.clone()))
		.unwrap_or_else(|_| error_response(http::StatusCode::INTERNAL_SERVER_ERROR, "reject"))
}

async fn run_websocket_step(step: WebsocketStep, client: TokioIo<hyper::upgrade::Upgraded>, destination: Destination) {
	let result = match step {
		WebsocketStep::Echo => websocket::echo(client).await,
		WebsocketStep::Listen | WebsocketStep::Timeout => websocket::listen(client).await,
		WebsocketStep::Close => {
			let (_, mut write_half) = tokio::io::split(client);
			write_half.shutdown().await
		},
		WebsocketStep::Passthrough | WebsocketStep::Forward => dial_and_splice(client, &destination).await,
		WebsocketStep::Reject(_) => unreachable!("rejects never reach the upgraded stream"),
	};
	let _ = result;
}

/// Dials `destination`, performs a minimal client-side WebSocket handshake,
/// and splices frames between the accepted client and that upstream (§4.6
/// "passthrough/forward"). The handshake is hand-rolled rather than pulled
/// from a client WS crate since the only thing needed is the upgrade
/// round-trip; framing itself is `websocket::splice`'s job.
async fn dial_and_splice(client: TokioIo<hyper::upgrade::Upgraded>, destination: &Destination) -> std::io::Result<()> {
	let mut upstream = TcpStream::connect((destination.hostname.as_str(), destination.port)).await?;

	use base64::Engine;
	use rand::RngCore;
	let mut key_bytes = [0u8; 16];
	rand::rng().fill_bytes(&mut key_bytes);
	let client_key = base64::engine::general_purpose::STANDARD.encode(key_bytes);

	let handshake = format!(
		"GET / HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n\r\n",
		host = destination.hostname,
		key = client_key,
	);
	upstream.write_all(handshake.as_bytes()).await?;

	let mut buf = Vec::with_capacity(512);
	let mut chunk = [0u8; 512];
	loop {
		let n = upstream.read(&mut chunk).await?;
		if n == 0 {
			return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "upstream closed during handshake"));
		}
		buf.extend_from_slice(&chunk[..n]);
		if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
			let trailing = buf.split_off(pos + 4);
			return websocket::splice(client, PrefixedUpstream::new(trailing, upstream)).await;
		}
		if buf.len() > 8192 {
			return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "upstream handshake response too large"));
		}
	}
}

/// Wraps the upstream TCP stream plus whatever frame bytes arrived attached
/// to its handshake response, so `websocket::splice` sees a single
/// contiguous stream starting right after the `\r\n\r\n`.
struct PrefixedUpstream {
	prefix: Bytes,
	pos: usize,
	inner: TcpStream,
}

impl PrefixedUpstream {
	fn new(prefix: Vec<u8>, inner: TcpStream) -> Self {
		PrefixedUpstream {
			prefix: Bytes::from(prefix),
			pos: 0,
			inner,
		}
	}
}

impl tokio::io::AsyncRead for PrefixedUpstream {
	fn poll_read(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		let this = self.get_mut();
		if this.pos < this.prefix.len() {
			let remaining = &this.prefix[this.pos..];
			let n = remaining.len().min(buf.remaining());
			buf.put_slice(&remaining[..n]);
			this.pos += n;
			return std::task::Poll::Ready(Ok(()));
		}
		std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl tokio::io::AsyncWrite for PrefixedUpstream {
	fn poll_write(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<Result<usize, std::io::Error>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}
	fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), std::io::Error>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}
	fn poll_shutdown(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Result<(), std::io::Error>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a `host:port` string (bare IPv6 hosts aren't bracketed since
/// `CONNECT`/`Host` authorities never carry a bracket in practice here).
fn parse_host_port(authority: &str) -> Option<(String, u16)> {
	let (host, port) = authority.rsplit_once(':')?;
	let port: u16 = port.parse().ok()?;
	Some((host.to_string(), port))
}

/// Whether `host` matches a `tlsPassthrough` rule: either an exact match, or
/// (when `rule` starts with `.`) a subdomain of it.
fn suffix_matches(host: &str, rule: &str) -> bool {
	match rule.strip_prefix('.') {
		Some(suffix) => host.eq_ignore_ascii_case(suffix) || host.to_ascii_lowercase().ends_with(&format!(".{suffix}")),
		None => host.eq_ignore_ascii_case(rule),
	}
}

fn build_request_record(
	req: hyper::Request<Incoming>,
	protocol: Protocol,
	remote_addr: SocketAddr,
	default_destination: Option<Destination>,
) -> Result<RequestRecord, hyper::Response<Body>> {
	let record = build_request_record_parts(&req, protocol, remote_addr, default_destination)?;
	let mut record = record;
	record.body = Body::new(req.into_body());
	Ok(record)
}

fn build_request_record_parts(
	req: &hyper::Request<Incoming>,
	protocol: Protocol,
	remote_addr: SocketAddr,
	default_destination: Option<Destination>,
) -> Result<RequestRecord, hyper::Response<Body>> {
	let destination = destination_for(req, protocol, default_destination)
		.ok_or_else(|| error_response(http::StatusCode::BAD_REQUEST, "no Host header and no CONNECT target"))?;
	let url = build_url(req, protocol, &destination)
		.map_err(|_| error_response(http::StatusCode::BAD_REQUEST, "could not reconstruct request URL"))?;

	let mut raw_headers = RawHeaders::default();
	for (name, value) in req.headers() {
		raw_headers.push(name.as_str(), value.to_str().unwrap_or_default());
	}

	Ok(RequestRecord {
		id: Uuid::new_v4(),
		protocol,
		http_version: req.version(),
		method: req.method().clone(),
		path: req.uri().path().to_string(),
		url,
		raw_headers,
		destination,
		remote_addr,
		body: Body::empty(),
		raw_trailers: RawHeaders::default(),
		timing: TimingEvents::default(),
		tags: Vec::new(),
		matched_rule_id: None,
	})
}

fn destination_for(
	req: &hyper::Request<Incoming>,
	protocol: Protocol,
	default_destination: Option<Destination>,
) -> Option<Destination> {
	if let Some(authority) = req.uri().authority() {
		if let Some((host, port)) = parse_host_port(authority.as_str()) {
			return Some(Destination { hostname: host, port });
		}
	}
	if let Some(host_header) = req.headers().get(http::header::HOST).and_then(|h| h.to_str().ok()) {
		if let Some((host, port)) = parse_host_port(host_header) {
			return Some(Destination { hostname: host, port });
		}
		let port = if protocol.is_tls() { 443 } else { 80 };
		return Some(Destination {
			hostname: host_header.to_string(),
			port,
		});
	}
	default_destination
}

fn build_url(req: &hyper::Request<Incoming>, protocol: Protocol, destination: &Destination) -> Result<url::Url, url::ParseError> {
	if let Some(path_and_query) = req.uri().path_and_query() {
		if req.uri().authority().is_some() {
			return url::Url::parse(&req.uri().to_string());
		}
		let authority = format!("{}:{}", destination.hostname, destination.port);
		return url::Url::parse(&format!("{}://{}{}", protocol.as_str(), authority, path_and_query.as_str()));
	}
	url::Url::parse(&format!("{}://{}/", protocol.as_str(), destination.hostname))
}

fn response_record_to_hyper(response: ResponseRecord) -> hyper::Response<Body> {
	let mut builder = hyper::Response::builder().status(response.status);
	for (name, value) in &response.raw_headers.0 {
		builder = builder.header(name.as_str(), value.as_str());
	}
	builder
		.body(response.body)
		.unwrap_or_else(|_| error_response(http::StatusCode::INTERNAL_SERVER_ERROR, "response"))
}

fn error_response(status: http::StatusCode, message: &str) -> hyper::Response<Body> {
	hyper::Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "text/plain")
		.body(Body::from(message.to_string()))
		.unwrap_or_else(|_| hyper::Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn suffix_matches_exact_and_subdomains() {
		assert!(suffix_matches("example.com", "example.com"));
		assert!(suffix_matches("api.example.com", ".example.com"));
		assert!(!suffix_matches("evilexample.com", ".example.com"));
	}

	#[test]
	fn parse_host_port_splits_cleanly() {
		assert_eq!(parse_host_port("example.com:8443"), Some(("example.com".to_string(), 8443)));
		assert_eq!(parse_host_port("example.com"), None);
	}

	#[test]
	fn find_subslice_locates_header_terminator() {
		let haystack = b"HTTP/1.1 101 Switching Protocols\r\n\r\nleftover";
		assert_eq!(find_subslice(haystack, b"\r\n\r\n"), Some(33));
	}
}
