//! TLS termination (inbound, SNI-driven) and TLS dialing (outbound,
//! per-upstream trust pool). Grounded on the teacher's `transport/tls.rs`
//! `provider()`/`insecure` modules; the SNI-deferred server config resolver
//! is new, built on `tokio_rustls::LazyConfigAcceptor` to satisfy §4.2's
//! "SNI-based cert selection" requirement (the teacher's own code picks a
//! config before accepting, since it doesn't need per-host certs).

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::LazyConfigAcceptor;

use crate::ca::CertificateAuthority;
use crate::errors::{TlsClientError, TlsFailureCause};
use crate::transport::stream::{Socket, SocketType};

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Resolves a leaf certificate on demand from the SNI presented in the
/// `ClientHello`, lazily minting it via [`CertificateAuthority::leaf_for_sni`].
///
/// `rustls`'s `ResolvesServerCert` trait is synchronous, so the leaf must
/// already be in the cache by the time this runs; [`accept`] pre-resolves it
/// with the async `leaf_for_sni` call before handing control to rustls.
struct FixedCert(Arc<CertifiedKey>);

impl std::fmt::Debug for FixedCert {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FixedCert").finish()
	}
}

impl ResolvesServerCert for FixedCert {
	fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		Some(self.0.clone())
	}
}

fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<CertifiedKey> {
	let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
		.collect::<Result<_, _>>()?;
	let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
		.ok_or_else(|| anyhow::anyhow!("no private key found in leaf PEM"))?;
	let signing_key = provider().key_provider.load_private_key(key)?;
	Ok(CertifiedKey::new(certs, signing_key))
}

/// Accepts an inbound TLS connection, minting (or reusing) a leaf cert for
/// whatever SNI the client presents. Implements §4.2 steps 2-3 and the
/// `tls-passthrough`/ALPN-fallback behavior described there.
pub async fn accept(
	conn: Socket,
	ca: &CertificateAuthority,
	http2: crate::config::Http2Mode,
) -> Result<Socket, TlsClientError> {
	let (ext, counter, inner) = conn.into_parts();
	let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), Box::new(inner));
	tokio::pin!(acceptor);

	let start = acceptor.as_mut().await.map_err(|e| TlsClientError {
		cause: classify_io_error(&e),
		sni: None,
	})?;

	let sni = start.client_hello().server_name().map(|s| s.to_string());

	let leaf = match &sni {
		Some(host) => ca.leaf_for_sni(host).await.map_err(|_| TlsClientError {
			cause: TlsFailureCause::CertRejected,
			sni: sni.clone(),
		})?,
		None => {
			return Err(TlsClientError {
				cause: TlsFailureCause::UnknownCa,
				sni: None,
			});
		},
	};

	let certified = certified_key_from_pem(&leaf.cert_pem, &leaf.key_pem).map_err(|_| TlsClientError {
		cause: TlsFailureCause::CertRejected,
		sni: sni.clone(),
	})?;

	let mut cfg = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.expect("static TLS version list is valid")
		.with_no_client_auth()
		.with_cert_resolver(Arc::new(FixedCert(Arc::new(certified))));

	cfg.alpn_protocols = match http2 {
		crate::config::Http2Mode::Disabled => vec![b"http/1.1".to_vec()],
		crate::config::Http2Mode::Enabled => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
		// "fallback": advertise both, but prefer http/1.1 when the client offers it.
		crate::config::Http2Mode::Fallback => vec![b"http/1.1".to_vec(), b"h2".to_vec()],
	};

	let stream = start
		.into_stream(Arc::new(cfg))
		.await
		.map_err(|e| TlsClientError {
			cause: classify_io_error(&e),
			sni: sni.clone(),
		})?;

	Ok(Socket::from_tls(ext, counter, stream.into()))
}

fn classify_io_error(e: &std::io::Error) -> TlsFailureCause {
	if e.kind() == std::io::ErrorKind::TimedOut {
		return TlsFailureCause::HandshakeTimeout;
	}
	if let Some(inner) = e.get_ref() {
		if let Some(tls_err) = inner.downcast_ref::<rustls::Error>() {
			return match tls_err {
				rustls::Error::InvalidCertificate(_) => TlsFailureCause::CertRejected,
				rustls::Error::NoCertificatesPresented => TlsFailureCause::UnknownCa,
				rustls::Error::AlertReceived(alert) => TlsFailureCause::Alert(u8::from(*alert)),
				_ => TlsFailureCause::NoSharedCipher,
			};
		}
	}
	TlsFailureCause::NetErr
}

/// Outbound TLS: used by the passthrough dialer for HTTPS upstreams. Trust
/// is either the default system roots plus configured extras, or disabled
/// entirely for hosts in `ignoreHostHttpsErrors` (§4.5 step 5).
pub mod outbound {
	use rustls::RootCertStore;
	use rustls::client::danger::{ServerCertVerifier, WebPkiServerVerifier};

	use super::*;

	pub fn client_config(
		roots: Arc<RootCertStore>,
		insecure: bool,
	) -> anyhow::Result<Arc<rustls::ClientConfig>> {
		let builder = rustls::ClientConfig::builder_with_provider(provider())
			.with_protocol_versions(ALL_TLS_VERSIONS)?;
		let mut cfg = if insecure {
			builder
				.dangerous()
				.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
				.with_no_client_auth()
		} else {
			let verifier = WebPkiServerVerifier::builder(roots).build()?;
			builder
				.dangerous()
				.with_custom_certificate_verifier(verifier as Arc<dyn ServerCertVerifier>)
				.with_no_client_auth()
		};
		cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
		Ok(Arc::new(cfg))
	}
}

pub mod insecure {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::CertificateDer;

	use super::*;

	/// Skips certificate verification entirely. Used only for hosts the
	/// caller has explicitly listed in `ignoreHostHttpsErrors`.
	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
			]
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ca::{CertificateAuthority, RootCaOptions};

	#[test]
	fn certified_key_builds_from_minted_leaf() {
		let ca = CertificateAuthority::generate(RootCaOptions::default()).unwrap();
		let rt = tokio::runtime::Runtime::new().unwrap();
		let leaf = rt.block_on(ca.leaf_for_sni("example.com")).unwrap();
		certified_key_from_pem(&leaf.cert_pem, &leaf.key_pem).unwrap();
	}
}
