//! Parent-proxy `CONNECT` tunneling (§4.5 step 4, `proxyConfig.proxyUrl`).
//! Adapted near-verbatim from the teacher's upstream `CONNECT` handshake:
//! write the request line, read the status line, and treat anything other
//! than a `200` as a dial failure.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::transport::Socket;

/// Issues `CONNECT dest HTTP/1.1` over `conn` and waits for a `200`
/// response. `dest` is `host:port`.
pub async fn handshake(conn: &mut Socket, dest: &str) -> Result<(), anyhow::Error> {
	let req = format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n\r\n");
	conn.write_all(req.as_bytes()).await?;
	conn.flush().await?;

	let mut buf = Vec::with_capacity(256);
	let mut chunk = [0u8; 256];
	loop {
		let n = conn.read(&mut chunk).await?;
		if n == 0 {
			anyhow::bail!("upstream proxy closed the connection during CONNECT handshake");
		}
		buf.extend_from_slice(&chunk[..n]);
		if buf.windows(4).any(|w| w == b"\r\n\r\n") {
			break;
		}
		if buf.len() > 8192 {
			anyhow::bail!("CONNECT response headers exceeded 8KiB without terminating");
		}
	}

	if buf.starts_with(b"HTTP/1.1 200") || buf.starts_with(b"HTTP/1.0 200") {
		return Ok(());
	}
	if buf.starts_with(b"HTTP/1.1 407") || buf.starts_with(b"HTTP/1.0 407") {
		anyhow::bail!("upstream proxy requires authentication (407) for CONNECT {dest}");
	}
	let status_line = buf
		.split(|&b| b == b'\r' || b == b'\n')
		.next()
		.map(|l| String::from_utf8_lossy(l).into_owned())
		.unwrap_or_default();
	anyhow::bail!("upstream proxy refused CONNECT {dest}: {status_line}")
}

#[cfg(test)]
mod tests {
	use std::net::{IpAddr, Ipv4Addr, SocketAddr};
	use std::time::Instant;

	use super::*;
	use crate::transport::stream::TcpConnectionInfo;

	fn dummy_info() -> TcpConnectionInfo {
		let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
		TcpConnectionInfo {
			peer_addr: addr,
			local_addr: addr,
			start: Instant::now(),
		}
	}

	#[tokio::test]
	async fn handshake_accepts_200_response() {
		let (client, mut server) = tokio::io::duplex(1024);
		let mut socket = Socket::from_memory(client, dummy_info());
		let server_task = tokio::spawn(async move {
			let mut buf = [0u8; 256];
			let n = server.read(&mut buf).await.unwrap();
			assert!(buf[..n].starts_with(b"CONNECT example.com:443"));
			server.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
		});
		handshake(&mut socket, "example.com:443").await.unwrap();
		server_task.await.unwrap();
	}

	#[tokio::test]
	async fn handshake_rejects_non_200_response() {
		let (client, mut server) = tokio::io::duplex(1024);
		let mut socket = Socket::from_memory(client, dummy_info());
		let server_task = tokio::spawn(async move {
			let mut buf = [0u8; 256];
			let _ = server.read(&mut buf).await.unwrap();
			server.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await.unwrap();
		});
		let result = handshake(&mut socket, "example.com:443").await;
		assert!(result.is_err());
		server_task.await.unwrap();
	}
}
