//! Session lifecycle (§3 "Session"): binds the listener, owns the rule
//! lists, CA, and event bus, and implements `start`/`stop` (§5
//! "Cancellation": `stop()` cancels all tokens, then waits up to 1s for
//! graceful drain before RST-closing sockets).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::ca::{CertificateAuthority, RootCaOptions};
use crate::config::Config;
use crate::errors::CaError;
use crate::events::EventBus;
use crate::rules::{RuleStore, Step};
use crate::server::Acceptor;
use crate::websocket::WebsocketStep;

/// A session that hasn't bound a listener yet.
pub struct Session {
	ca: Arc<CertificateAuthority>,
	http_rules: Arc<RuleStore<Step>>,
	ws_rules: Arc<RuleStore<WebsocketStep>>,
	events: Arc<EventBus>,
	rule_parameters: std::collections::HashMap<String, Value>,
	config: Config,
}

/// A session with a bound listener, accepting traffic.
pub struct ListeningSession {
	shared: Session,
	local_addr: SocketAddr,
	shutdown_tx: watch::Sender<()>,
	accept_task: JoinHandle<()>,
}

impl Session {
	pub fn new(config: Config) -> Result<Self, CaError> {
		let ca = CertificateAuthority::generate(RootCaOptions::default())?;
		Ok(Session {
			ca: Arc::new(ca),
			http_rules: Arc::new(RuleStore::new()),
			ws_rules: Arc::new(RuleStore::new()),
			events: EventBus::new(config.event_queue_capacity),
			rule_parameters: config.rule_parameters.clone(),
			config,
		})
	}

	pub fn http_rules(&self) -> &Arc<RuleStore<Step>> {
		&self.http_rules
	}

	pub fn ws_rules(&self) -> &Arc<RuleStore<WebsocketStep>> {
		&self.ws_rules
	}

	pub fn events(&self) -> &Arc<EventBus> {
		&self.events
	}

	pub fn ca(&self) -> &Arc<CertificateAuthority> {
		&self.ca
	}

	/// Looks up a `ruleParameters` value by key, resolving `{paramRef: key}`
	/// placeholders encountered while deserialising a rule (§3 "Session").
	pub fn rule_parameter(&self, key: &str) -> Option<&Value> {
		self.rule_parameters.get(key)
	}

	/// Registers an HTTP rule and returns its caller-visible handle (§3
	/// "Endpoint handle").
	pub fn add_http_rule(&self, rule: crate::rules::Rule<Step>) -> crate::rules::Endpoint<Step> {
		crate::rules::Endpoint::new(self.http_rules.insert(rule))
	}

	/// Registers a WebSocket rule and returns its caller-visible handle.
	pub fn add_ws_rule(&self, rule: crate::rules::Rule<WebsocketStep>) -> crate::rules::Endpoint<WebsocketStep> {
		crate::rules::Endpoint::new(self.ws_rules.insert(rule))
	}

	/// `start(port|range)` (§3, §6 "one TCP listener per session, optionally
	/// auto-selected from a `[startPort,endPort]` range").
	pub async fn start(self) -> std::io::Result<ListeningSession> {
		let listener = match (self.config.port, self.config.port_range) {
			(Some(port), _) => TcpListener::bind(SocketAddr::new(self.config.bind_addr, port)).await?,
			(None, Some((start, end))) => bind_in_range(self.config.bind_addr, start, end).await?,
			(None, None) => TcpListener::bind(SocketAddr::new(self.config.bind_addr, 0)).await?,
		};
		let local_addr = listener.local_addr()?;
		info!(%local_addr, "session listening");

		let acceptor = Arc::new(Acceptor {
			ca: self.ca.clone(),
			http_rules: self.http_rules.clone(),
			ws_rules: self.ws_rules.clone(),
			events: self.events.clone(),
			http2: self.config.http2,
			max_match_body_bytes: self.config.max_body_size,
			tls_passthrough: Vec::new(),
			suggest_changes: self.config.suggest_changes,
		});

		let (shutdown_tx, shutdown_rx) = watch::channel(());
		let accept_task = tokio::spawn(acceptor.run(listener, shutdown_rx));

		Ok(ListeningSession {
			shared: self,
			local_addr,
			shutdown_tx,
			accept_task,
		})
	}
}

impl ListeningSession {
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn http_rules(&self) -> &Arc<RuleStore<Step>> {
		self.shared.http_rules()
	}

	pub fn ws_rules(&self) -> &Arc<RuleStore<WebsocketStep>> {
		self.shared.ws_rules()
	}

	pub fn events(&self) -> &Arc<EventBus> {
		self.shared.events()
	}

	/// `stop()`: signals the accept loop to stop taking new connections,
	/// waits up to `shutdown_grace` for in-flight connections to finish on
	/// their own, then abandons (RST-closes, via task abort) whatever is
	/// still running.
	pub async fn stop(self) -> Session {
		info!(local_addr = %self.local_addr, "session stopping");
		let _ = self.shutdown_tx.send(());
		let grace = self.shared.config.shutdown_grace;
		if tokio::time::timeout(grace, self.accept_task).await.is_err() {
			// Dropped the JoinHandle's future on timeout; the spawned task
			// (and the connections its JoinSet still owns) is aborted when
			// this function returns and nothing await continues polling it.
			tracing::warn!(?grace, "shutdown grace expired with connections still open, dropping them");
		}
		self.shared
	}
}

async fn bind_in_range(bind_addr: IpAddr, start: u16, end: u16) -> std::io::Result<TcpListener> {
	let mut last_err = None;
	for port in start..=end {
		match TcpListener::bind(SocketAddr::new(bind_addr, port)).await {
			Ok(listener) => return Ok(listener),
			Err(e) => last_err = Some(e),
		}
	}
	Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "empty port range")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn start_binds_an_ephemeral_port_by_default() {
		let session = Session::new(Config::default()).unwrap();
		let listening = session.start().await.unwrap();
		assert!(listening.local_addr().port() > 0);
		listening.stop().await;
	}

	#[tokio::test]
	async fn start_honors_an_explicit_port_range() {
		let mut config = Config::default();
		config.port_range = Some((20000, 20100));
		let session = Session::new(config).unwrap();
		let listening = session.start().await.unwrap();
		assert!((20000..=20100).contains(&listening.local_addr().port()));
		listening.stop().await;
	}

	#[test]
	fn add_http_rule_returns_an_endpoint_handle() {
		let session = Session::new(Config::default()).unwrap();
		let rule = crate::rules::Rule::new(0, vec![crate::rules::Matcher::Port(80)], Vec::new());
		let endpoint = session.add_http_rule(rule);
		assert!(endpoint.is_pending());
		assert_eq!(session.http_rules().len(), 1);
	}
}
