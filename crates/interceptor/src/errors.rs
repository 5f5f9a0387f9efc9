//! Structured error taxonomy. Each variant carries the HTTP status and the
//! event-bus tag name it must surface as, so callers never have to restate
//! that mapping (see SPEC_FULL.md §A.3 / §7).

use http::StatusCode;
use thiserror::Error;

/// Top-level engine error. Every fallible engine operation that can become
/// visible to a client (as opposed to a pure I/O failure, which is only ever
/// an event) resolves to one of these.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("no rule matched the request")]
	NoMatchingRule(NoMatchDiagnostic),

	#[error("matcher {kind} (index {index}) raised an error: {source}")]
	RuleMatcherError {
		kind: &'static str,
		index: usize,
		#[source]
		source: anyhow::Error,
	},

	#[error("callback step raised an error: {0}")]
	CallbackError(anyhow::Error),

	#[error(transparent)]
	Passthrough(#[from] PassthroughError),

	#[error("transform requires decoded body but the size cap was exceeded")]
	BodyTooLargeForTransform,

	#[error("Cannot set custom :{0} pseudoheader values")]
	InvalidOverride(&'static str),

	#[error("connection dropped before a complete request: {0}")]
	ClientError(String),

	#[error(transparent)]
	Tls(#[from] TlsClientError),

	#[error("failed to read transform file {path}: {source}")]
	TransformFileError {
		path: String,
		#[source]
		source: std::io::Error,
	},
}

impl EngineError {
	/// The HTTP status this error becomes on the wire, when a response can
	/// still be sent at all.
	pub fn status(&self) -> StatusCode {
		match self {
			EngineError::NoMatchingRule(_) => StatusCode::SERVICE_UNAVAILABLE,
			EngineError::RuleMatcherError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
			EngineError::CallbackError(_) => StatusCode::INTERNAL_SERVER_ERROR,
			EngineError::Passthrough(p) => p.status(),
			EngineError::BodyTooLargeForTransform => StatusCode::BAD_GATEWAY,
			EngineError::InvalidOverride(_) => StatusCode::INTERNAL_SERVER_ERROR,
			EngineError::ClientError(_) => StatusCode::BAD_REQUEST,
			EngineError::Tls(_) => StatusCode::INTERNAL_SERVER_ERROR,
			EngineError::TransformFileError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// The event-bus tag this error is recorded under, e.g. `rule-matcher-error`.
	pub fn tag(&self) -> String {
		match self {
			EngineError::NoMatchingRule(_) => "no-matching-rule".to_string(),
			EngineError::RuleMatcherError { .. } => "rule-matcher-error".to_string(),
			EngineError::CallbackError(_) => "callback-error".to_string(),
			EngineError::Passthrough(p) => p.tag(),
			EngineError::BodyTooLargeForTransform => "body-too-large-for-transform".to_string(),
			EngineError::InvalidOverride(_) => "invalid-override".to_string(),
			EngineError::ClientError(_) => "client-error".to_string(),
			EngineError::Tls(_) => "tls-client-error".to_string(),
			EngineError::TransformFileError { .. } => "transform-file-error".to_string(),
		}
	}
}

#[derive(Debug)]
pub struct NoMatchDiagnostic {
	pub method: String,
	pub url: String,
	pub rule_summaries: Option<Vec<String>>,
}

/// Failures from the passthrough/forward engine (§4.5, §7).
#[derive(Debug, Error)]
pub enum PassthroughError {
	#[error("failed to dial upstream {host}: {source}")]
	Dial {
		host: String,
		#[source]
		source: std::io::Error,
	},
	#[error("TLS handshake with upstream {host} failed: {cause}")]
	Tls { host: String, cause: String },
	#[error("reading from upstream failed: {0}")]
	UpstreamRead(std::io::Error),
	#[error("upstream dial timed out after {0:?}")]
	Timeout(std::time::Duration),
}

impl PassthroughError {
	pub fn status(&self) -> StatusCode {
		StatusCode::BAD_GATEWAY
	}

	/// The `passthrough-error:<code>` tag, where `<code>` mirrors common TLS/IO
	/// failure vocabulary (e.g. `SELF_SIGNED_CERT_IN_CHAIN`).
	pub fn tag(&self) -> String {
		match self {
			PassthroughError::Dial { .. } => "passthrough-error:ECONNREFUSED".to_string(),
			PassthroughError::Tls { cause, .. } => format!("passthrough-error:{cause}"),
			PassthroughError::UpstreamRead(_) => "passthrough-error:ECONNRESET".to_string(),
			PassthroughError::Timeout(_) => "passthrough-error:ETIMEDOUT".to_string(),
		}
	}

	/// The companion `passthrough-tls-error:<cause>` tag, emitted alongside
	/// `passthrough-error` only for TLS failures. Per §9's open question we
	/// fix the order here: `passthrough-tls-error` is pushed first, then
	/// `passthrough-error` — see DESIGN.md for the rationale.
	pub fn tls_tag(&self) -> Option<String> {
		match self {
			PassthroughError::Tls { cause, .. } => Some(format!("passthrough-tls-error:{cause}")),
			_ => None,
		}
	}
}

/// TLS failures during connection accept (§4.2).
#[derive(Debug, Error, Clone)]
#[error("tls client error: {cause}")]
pub struct TlsClientError {
	pub cause: TlsFailureCause,
	pub sni: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsFailureCause {
	CertRejected,
	NoSharedCipher,
	UnknownCa,
	Alert(u8),
	HandshakeTimeout,
	NetErr,
}

impl std::fmt::Display for TlsFailureCause {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TlsFailureCause::CertRejected => write!(f, "cert-rejected"),
			TlsFailureCause::NoSharedCipher => write!(f, "no-shared-cipher"),
			TlsFailureCause::UnknownCa => write!(f, "unknown-ca"),
			TlsFailureCause::Alert(n) => write!(f, "alert-{n}"),
			TlsFailureCause::HandshakeTimeout => write!(f, "handshake-timeout"),
			TlsFailureCause::NetErr => write!(f, "neterr"),
		}
	}
}

impl TlsClientError {
	pub fn tag(&self) -> String {
		format!("passthrough-tls-error:{}", self.cause)
	}
}

/// Errors from CA root generation / per-host leaf minting (§4.1).
#[derive(Debug, Error)]
pub enum CaError {
	#[error("failed to generate key pair: {0}")]
	KeyGeneration(rcgen::Error),
	#[error("failed to sign certificate: {0}")]
	Signing(rcgen::Error),
	#[error("hostname rejected: contains '_' outside a rewritable wildcard position: {0}")]
	InvalidHostname(String),
}

/// Body codec errors (§2 "Body codec").
#[derive(Debug, Error)]
pub enum CodecError {
	#[error("unsupported content-encoding: {0}")]
	UnsupportedEncoding(String),
	#[error("body exceeded the configured size cap")]
	LimitExceeded,
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Body(#[from] axum_core::Error),
}
