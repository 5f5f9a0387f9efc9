use std::io::IoSlice;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

#[derive(Debug, Clone)]
pub struct TcpConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

#[derive(Debug, Clone, Eq, PartialEq, Copy)]
pub enum Alpn {
	Http11,
	H2,
	Other,
}

impl From<&[u8]> for Alpn {
	fn from(value: &[u8]) -> Self {
		if value == b"h2" {
			Alpn::H2
		} else if value == b"http/1.1" {
			Alpn::Http11
		} else {
			Alpn::Other
		}
	}
}

#[derive(Debug, Clone)]
pub struct TlsConnectionInfo {
	pub server_name: Option<String>,
	pub negotiated_alpn: Option<Alpn>,
}

/// A socket plus the per-connection metadata the rest of the engine needs:
/// the peer/local addresses, TLS termination info (SNI, negotiated ALPN),
/// and a byte counter feeding the traffic-event stream (§4.7).
pub struct Socket {
	ext: Extension,
	inner: SocketType,
	counter: BytesCounter,
}

impl Socket {
	pub fn into_parts(self) -> (Extension, BytesCounter, SocketType) {
		(self.ext, self.counter, self.inner)
	}

	pub fn from_memory(stream: DuplexStream, info: TcpConnectionInfo) -> Self {
		let mut ext = Extension::new();
		ext.insert(info);
		Socket {
			ext,
			inner: SocketType::Memory(stream),
			counter: BytesCounter::default(),
		}
	}

	pub fn from_tcp(stream: TcpStream) -> anyhow::Result<Self> {
		let mut ext = Extension::new();
		stream.set_nodelay(true)?;
		ext.insert(TcpConnectionInfo {
			peer_addr: to_canonical(stream.peer_addr()?),
			local_addr: to_canonical(stream.local_addr()?),
			start: Instant::now(),
		});
		Ok(Socket {
			ext,
			inner: SocketType::Tcp(stream),
			counter: BytesCounter::default(),
		})
	}

	pub fn from_tls(
		mut ext: Extension,
		counter: BytesCounter,
		tls: TlsStream<Box<SocketType>>,
	) -> Self {
		let server_name = match &tls {
			TlsStream::Server(s) => {
				let (_, conn) = s.get_ref();
				conn.server_name().map(|s| s.to_string())
			},
			_ => None,
		};
		let negotiated_alpn = {
			let (_, conn) = tls.get_ref();
			conn.alpn_protocol().map(Alpn::from)
		};
		ext.insert(TlsConnectionInfo {
			server_name,
			negotiated_alpn,
		});
		Socket {
			ext,
			inner: SocketType::Tls(Box::new(tls)),
			counter,
		}
	}

	pub fn get_ext(&self) -> Extension {
		self.ext.clone()
	}

	pub fn ext<T: Send + Sync + 'static>(&self) -> Option<&T> {
		self.ext.get::<T>()
	}

	pub fn tcp(&self) -> &TcpConnectionInfo {
		self.ext.get::<TcpConnectionInfo>().expect("tcp info always set")
	}

	pub async fn dial(target: SocketAddr) -> anyhow::Result<Socket> {
		let stream = TcpStream::connect(target).await?;
		Socket::from_tcp(stream)
	}

	pub fn counter(&self) -> BytesCounter {
		self.counter.clone()
	}

	/// Wraps a hyper upgrade target (a CONNECT tunnel or a WebSocket upgrade)
	/// as a `Socket`, reusing the parent connection's extensions so a nested
	/// `handle_connection` pass still sees the original `TcpConnectionInfo`
	/// (§4.2 step 3: the CONNECT-tunnel stream is itself re-examined for a
	/// nested TLS handshake).
	pub fn from_upgraded(parent_ext: Arc<Extension>, upgraded: Upgraded) -> Self {
		Socket {
			ext: Extension::wrap(parent_ext),
			inner: SocketType::Upgraded(Box::new(TokioIo::new(upgraded))),
			counter: BytesCounter::default(),
		}
	}

	/// Re-prepends bytes already consumed from this socket (e.g. the TLS
	/// record header peeked to decide `tlsPassthrough`, §4.2 step 2) so the
	/// next reader sees them as if they'd never been read.
	pub fn prepend(mut self, prefix: Vec<u8>) -> Self {
		if prefix.is_empty() {
			return self;
		}
		self.inner = SocketType::Prefixed(Bytes::from(prefix), 0, Box::new(self.inner));
		self
	}
}

/// The concrete transport behind a [`Socket`]. `Boxed` lets a TLS stream
/// wrap an arbitrary inner socket type (needed because `tokio_rustls`
/// requires `Box<dyn AsyncRead + AsyncWrite>`-shaped inner streams for the
/// SNI-deferred acceptor).
pub enum SocketType {
	Tcp(TcpStream),
	Tls(Box<TlsStream<Box<SocketType>>>),
	Memory(DuplexStream),
	Boxed(Box<SocketType>),
	/// The raw IO behind a hyper CONNECT or WebSocket upgrade.
	Upgraded(Box<TokioIo<Upgraded>>),
	/// Bytes already consumed from `inner` (e.g. a peeked TLS record header)
	/// that must be served back to the next reader before `inner` resumes.
	Prefixed(Bytes, usize, Box<SocketType>),
}

impl AsyncRead for SocketType {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Memory(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Boxed(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Upgraded(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketType::Prefixed(prefix, pos, inner) => {
				if *pos < prefix.len() {
					let remaining = &prefix[*pos..];
					let n = remaining.len().min(buf.remaining());
					buf.put_slice(&remaining[..n]);
					*pos += n;
					return Poll::Ready(Ok(()));
				}
				Pin::new(inner.as_mut()).poll_read(cx, buf)
			},
		}
	}
}

impl AsyncWrite for SocketType {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Memory(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Boxed(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Upgraded(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketType::Prefixed(_, _, inner) => Pin::new(inner.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Tls(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Memory(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Boxed(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Upgraded(inner) => Pin::new(inner).poll_flush(cx),
			SocketType::Prefixed(_, _, inner) => Pin::new(inner.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Memory(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Boxed(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Upgraded(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketType::Prefixed(_, _, inner) => Pin::new(inner.as_mut()).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, std::io::Error>> {
		match self.get_mut() {
			SocketType::Tcp(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Tls(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Memory(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Boxed(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Upgraded(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketType::Prefixed(_, _, inner) => Pin::new(inner.as_mut()).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match self {
			SocketType::Tcp(inner) => inner.is_write_vectored(),
			SocketType::Tls(inner) => inner.is_write_vectored(),
			SocketType::Memory(inner) => inner.is_write_vectored(),
			SocketType::Boxed(inner) => inner.is_write_vectored(),
			SocketType::Upgraded(inner) => inner.is_write_vectored(),
			SocketType::Prefixed(_, _, inner) => inner.is_write_vectored(),
		}
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let before = buf.filled().len();
		let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
		self.counter.recv(buf.filled().len() - before);
		poll
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, std::io::Error>> {
		let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
		if let Poll::Ready(Ok(n)) = poll {
			self.counter.sent(n);
		}
		poll
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Result<(), std::io::Error>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, std::io::Error>> {
		let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
		if let Poll::Ready(Ok(n)) = poll {
			self.counter.sent(n);
		}
		poll
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}

/// A type map for per-connection metadata, layered so a TLS socket built on
/// top of a plaintext one inherits the plaintext layer's extensions (e.g.
/// the original `TcpConnectionInfo`) without copying them.
#[derive(Debug, Clone)]
pub enum Extension {
	Single(http::Extensions),
	Wrapped(http::Extensions, Arc<Extension>),
}

impl Default for Extension {
	fn default() -> Self {
		Self::new()
	}
}

impl Extension {
	pub fn new() -> Self {
		Extension::Single(http::Extensions::new())
	}

	pub fn wrap(ext: Arc<Extension>) -> Self {
		Extension::Wrapped(http::Extensions::new(), ext)
	}

	pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, val: T) -> Option<T> {
		match self {
			Extension::Single(extensions) => extensions.insert(val),
			Extension::Wrapped(extensions, _) => extensions.insert(val),
		}
	}

	pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
		match self {
			Extension::Single(extensions) => extensions.get::<T>(),
			Extension::Wrapped(extensions, inner) => extensions.get::<T>().or_else(|| inner.get::<T>()),
		}
	}
}

fn to_canonical(addr: SocketAddr) -> SocketAddr {
	SocketAddr::from((addr.ip().to_canonical(), addr.port()))
}

#[derive(Default, Debug, Clone)]
pub struct BytesCounter {
	counts: Arc<(AtomicU64, AtomicU64)>,
}

impl BytesCounter {
	pub fn sent(&self, amt: usize) {
		self.counts.0.fetch_add(amt as u64, Ordering::Relaxed);
	}
	pub fn recv(&self, amt: usize) {
		self.counts.1.fetch_add(amt as u64, Ordering::Relaxed);
	}
	pub fn load(&self) -> (u64, u64) {
		(
			self.counts.0.load(Ordering::Relaxed),
			self.counts.1.load(Ordering::Relaxed),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extension_wrapped_falls_back_to_inner() {
		let mut base = Extension::new();
		base.insert(42u32);
		let mut wrapped = Extension::wrap(Arc::new(base));
		assert_eq!(wrapped.get::<u32>(), Some(&42));
		wrapped.insert(7u8);
		assert_eq!(wrapped.get::<u8>(), Some(&7));
	}

	#[test]
	fn bytes_counter_accumulates() {
		let c = BytesCounter::default();
		c.sent(10);
		c.recv(3);
		c.sent(5);
		assert_eq!(c.load(), (15, 3));
	}
}
