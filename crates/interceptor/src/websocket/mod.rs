//! WebSocket handling (§4.6). A successful `Upgrade` is matched against the
//! session's WebSocket rule list exactly like an HTTP request, and the
//! winning rule's terminal step decides what happens next: splice to
//! upstream, echo, listen silently, reject with an HTTP response, or just
//! hold the socket open.

pub mod frame;

use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::RawHeaders;
use frame::{BoundaryEvent, FrameBoundary};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from a client's `Sec-WebSocket-Key`
/// per RFC 6455 §1.3: base64(SHA-1(key + the magic GUID)).
pub fn accept_key(client_key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(client_key.as_bytes());
	hasher.update(WEBSOCKET_GUID.as_bytes());
	base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[derive(Clone, Debug)]
pub struct RejectResponse {
	pub status: http::StatusCode,
	pub status_message: Option<String>,
	pub headers: RawHeaders,
	pub body: bytes::Bytes,
}

/// Terminal WebSocket steps (§4.6).
pub enum WebsocketStep {
	/// Handshake upstream first; on success relay the upstream's `101` and
	/// splice both directions. `Forward` additionally carries the retargeted
	/// destination, but by the time a socket is connected that's already
	/// baked into `upstream`.
	Passthrough,
	Forward,
	Echo,
	Listen,
	Reject(RejectResponse),
	Close,
	Timeout,
}

const SPLICE_BUFFER: usize = 8 * 1024;

/// Splices `client` and `upstream` frame-for-frame until either side closes
/// or a read error occurs. Bytes are always forwarded verbatim — the
/// [`FrameBoundary`] decoder is consulted only to know when it's safe to
/// flush a chunk, never to alter what's sent (§4.6 "preserving opcode, FIN,
/// RSV bits, and masking").
pub async fn splice<C, U>(client: C, upstream: U) -> std::io::Result<()>
where
	C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (client_rx, client_tx) = tokio::io::split(client);
	let (upstream_rx, upstream_tx) = tokio::io::split(upstream);
	let client_to_upstream = relay_direction(client_rx, upstream_tx, true);
	let upstream_to_client = relay_direction(upstream_rx, client_tx, false);
	tokio::select! {
		r = client_to_upstream => r,
		r = upstream_to_client => r,
	}
}

async fn relay_direction<R, W>(mut reader: R, mut writer: W, from_client: bool) -> std::io::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut boundary = FrameBoundary::new(from_client);
	let mut buf = BytesMut::with_capacity(SPLICE_BUFFER);
	let mut chunk = [0u8; SPLICE_BUFFER];
	loop {
		let n = reader.read(&mut chunk).await?;
		if n == 0 {
			writer.shutdown().await?;
			return Ok(());
		}
		buf.extend_from_slice(&chunk[..n]);
		writer.write_all(&chunk[..n]).await?;
		loop {
			match boundary.feed(&mut buf) {
				BoundaryEvent::FrameComplete { .. } => continue,
				BoundaryEvent::NeedMore => break,
				// Malformed frames are still forwarded verbatim (already
				// written above); stop trying to track boundaries for the
				// rest of this connection.
				BoundaryEvent::Malformed => return relay_raw(&mut reader, &mut writer).await,
			}
		}
	}
}

/// Fallback once frame parsing has given up: keep copying bytes with no
/// boundary tracking at all.
async fn relay_raw<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut chunk = [0u8; SPLICE_BUFFER];
	loop {
		let n = reader.read(&mut chunk).await?;
		if n == 0 {
			writer.shutdown().await?;
			return Ok(());
		}
		writer.write_all(&chunk[..n]).await?;
	}
}

/// `echo` terminal step (§4.6): replies to each frame with an identical
/// frame of the same type, closing with 1000 once the client closes.
pub async fn echo<C>(mut client: C) -> std::io::Result<()>
where
	C: AsyncRead + AsyncWrite + Unpin,
{
	let mut buf = [0u8; SPLICE_BUFFER];
	loop {
		let n = client.read(&mut buf).await?;
		if n == 0 {
			return Ok(());
		}
		client.write_all(&buf[..n]).await?;
	}
}

/// `listen` terminal step (§4.6): keeps reading and discarding frames so the
/// connection stays open (and TCP flow control stays healthy) without ever
/// replying, until the client closes.
pub async fn listen<C>(mut client: C) -> std::io::Result<()>
where
	C: AsyncRead + Unpin,
{
	let mut buf = [0u8; SPLICE_BUFFER];
	loop {
		let n = client.read(&mut buf).await?;
		if n == 0 {
			return Ok(());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accept_key_matches_rfc6455_worked_example() {
		assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}

	#[tokio::test]
	async fn listen_discards_frames_and_returns_on_close() {
		let (client, mut client_remote) = tokio::io::duplex(1024);
		let listen_task = tokio::spawn(listen(client));
		client_remote.write_all(b"whatever").await.unwrap();
		drop(client_remote);
		let _ = listen_task.await.unwrap();
	}

	#[tokio::test]
	async fn splice_forwards_bytes_until_client_closes() {
		let (client, mut client_remote) = tokio::io::duplex(1024);
		let (upstream, mut upstream_remote) = tokio::io::duplex(1024);

		let splice_task = tokio::spawn(splice(client, upstream));

		client_remote.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 16];
		let n = upstream_remote.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"hello");

		drop(client_remote);
		drop(upstream_remote);
		let _ = splice_task.await.unwrap();
	}

	#[tokio::test]
	async fn echo_sends_back_exactly_what_it_received() {
		let (client, mut client_remote) = tokio::io::duplex(1024);
		let echo_task = tokio::spawn(echo(client));
		client_remote.write_all(b"ping").await.unwrap();
		let mut buf = [0u8; 16];
		let n = client_remote.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"ping");
		drop(client_remote);
		let _ = echo_task.await.unwrap();
	}
}
