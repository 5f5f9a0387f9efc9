//! SNI extraction from a TLS ClientHello (§4.2 "tlsPassthrough"). The
//! acceptor needs to decide whether to terminate TLS or splice the raw
//! connection through to an upstream *before* committing to a handshake, so
//! [`read_client_hello_prefix`] consumes exactly the record-header + record
//! bytes (no more, no less — the TLS record header carries its own length)
//! and [`peek_client_hello_sni`] parses just enough of it to find the
//! `server_name` extension. Whichever path the acceptor picks afterwards,
//! the consumed bytes are handed back via `Socket::prepend` so they're
//! replayed to the real TLS/plaintext reader as if never read at all.

use tokio::io::{AsyncRead, AsyncReadExt};

/// A minimal cursor that reports insufficient-data instead of panicking,
/// since a `peek()` may return a prefix shorter than the full ClientHello.
struct Cursor<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Cursor { buf, pos: 0 }
	}

	fn take(&mut self, n: usize) -> Option<&'a [u8]> {
		let end = self.pos.checked_add(n)?;
		let slice = self.buf.get(self.pos..end)?;
		self.pos = end;
		Some(slice)
	}

	fn u8(&mut self) -> Option<u8> {
		self.take(1).map(|s| s[0])
	}

	fn u16(&mut self) -> Option<u16> {
		self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
	}

	fn u24(&mut self) -> Option<usize> {
		self.take(3).map(|s| (s[0] as usize) << 16 | (s[1] as usize) << 8 | s[2] as usize)
	}

	fn skip(&mut self, n: usize) -> Option<()> {
		self.take(n).map(|_| ())
	}
}

const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const CLIENT_HELLO_MSG_TYPE: u8 = 0x01;
const SNI_EXTENSION_TYPE: u16 = 0x0000;
const SNI_HOST_NAME_TYPE: u8 = 0x00;
/// TLS caps plaintext record payloads at 2^14 bytes (RFC 8446 §5.1); a
/// ClientHello claiming more is malformed, not just large.
const MAX_TLS_RECORD_LEN: usize = 16384;

/// Reads exactly the leading bytes needed to tell whether a connection opens
/// with a TLS ClientHello and, if so, what SNI it carries — a single byte
/// for a plaintext connection, or the whole first TLS record for a
/// handshake. Returns the consumed bytes (for replay via `Socket::prepend`)
/// alongside the SNI, if any.
pub async fn read_client_hello_prefix<S: AsyncRead + Unpin>(
	stream: &mut S,
) -> std::io::Result<(Vec<u8>, Option<String>)> {
	let mut header = [0u8; 5];
	stream.read_exact(&mut header[..1]).await?;
	if header[0] != TLS_HANDSHAKE_CONTENT_TYPE {
		return Ok((header[..1].to_vec(), None));
	}
	stream.read_exact(&mut header[1..5]).await?;
	let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
	if record_len > MAX_TLS_RECORD_LEN {
		return Err(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			"TLS record exceeds the 2^14-byte plaintext limit",
		));
	}
	let mut body = vec![0u8; record_len];
	stream.read_exact(&mut body).await?;

	let mut full = header.to_vec();
	full.extend_from_slice(&body);
	let sni = peek_client_hello_sni(&full);
	Ok((full, sni))
}

/// Parses the `server_name` extension out of a single ClientHello record.
/// Returns `None` both when the hello carries no SNI and when `buf` doesn't
/// (yet) hold a complete enough record to tell — callers distinguish those
/// by re-peeking a larger prefix up to some cap before giving up.
pub fn peek_client_hello_sni(buf: &[u8]) -> Option<String> {
	let mut c = Cursor::new(buf);

	if c.u8()? != TLS_HANDSHAKE_CONTENT_TYPE {
		return None;
	}
	c.skip(2)?; // legacy_record_version
	let record_len = c.u16()? as usize;
	let record = c.take(record_len)?;

	let mut h = Cursor::new(record);
	if h.u8()? != CLIENT_HELLO_MSG_TYPE {
		return None;
	}
	let hello_len = h.u24()?;
	let hello = h.take(hello_len)?;

	let mut b = Cursor::new(hello);
	b.skip(2)?; // client_version
	b.skip(32)?; // random

	let session_id_len = b.u8()? as usize;
	b.skip(session_id_len)?;

	let cipher_suites_len = b.u16()? as usize;
	b.skip(cipher_suites_len)?;

	let compression_methods_len = b.u8()? as usize;
	b.skip(compression_methods_len)?;

	let extensions_len = b.u16()? as usize;
	let extensions = b.take(extensions_len)?;

	let mut e = Cursor::new(extensions);
	loop {
		let Some(ext_type) = e.u16() else { break };
		let Some(ext_len) = e.u16() else { break };
		let Some(ext_data) = e.take(ext_len as usize) else {
			break;
		};
		if ext_type == SNI_EXTENSION_TYPE {
			return parse_server_name_list(ext_data);
		}
	}
	None
}

fn parse_server_name_list(data: &[u8]) -> Option<String> {
	let mut c = Cursor::new(data);
	let list_len = c.u16()? as usize;
	let mut list = Cursor::new(c.take(list_len)?);
	loop {
		let Some(name_type) = list.u8() else { break };
		let Some(name_len) = list.u16() else { break };
		let Some(name) = list.take(name_len as usize) else {
			break;
		};
		if name_type == SNI_HOST_NAME_TYPE {
			return std::str::from_utf8(name).ok().map(str::to_string);
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sni_extension(host: &str) -> Vec<u8> {
		let host_bytes = host.as_bytes();
		let mut server_name = Vec::new();
		server_name.push(SNI_HOST_NAME_TYPE);
		server_name.extend_from_slice(&(host_bytes.len() as u16).to_be_bytes());
		server_name.extend_from_slice(host_bytes);

		let mut list = Vec::new();
		list.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
		list.extend_from_slice(&server_name);

		let mut ext = Vec::new();
		ext.extend_from_slice(&SNI_EXTENSION_TYPE.to_be_bytes());
		ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
		ext.extend_from_slice(&list);
		ext
	}

	fn wrap_client_hello(extensions: &[u8]) -> Vec<u8> {
		let mut hello = Vec::new();
		hello.extend_from_slice(&[0x03, 0x03]); // client_version TLS1.2
		hello.extend_from_slice(&[0u8; 32]); // random
		hello.push(0); // session_id_len
		hello.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites_len
		hello.extend_from_slice(&[0x13, 0x01]); // one cipher suite
		hello.push(1); // compression_methods_len
		hello.push(0); // null compression
		hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
		hello.extend_from_slice(extensions);

		let mut handshake = Vec::new();
		handshake.push(CLIENT_HELLO_MSG_TYPE);
		let len = hello.len();
		handshake.push((len >> 16) as u8);
		handshake.push((len >> 8) as u8);
		handshake.push(len as u8);
		handshake.extend_from_slice(&hello);

		let mut record = Vec::new();
		record.push(TLS_HANDSHAKE_CONTENT_TYPE);
		record.extend_from_slice(&[0x03, 0x01]); // legacy_record_version
		record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
		record.extend_from_slice(&handshake);
		record
	}

	#[test]
	fn extracts_sni_from_well_formed_hello() {
		let ext = sni_extension("example.com");
		let record = wrap_client_hello(&ext);
		assert_eq!(peek_client_hello_sni(&record), Some("example.com".to_string()));
	}

	#[test]
	fn truncated_buffer_reports_none_rather_than_panicking() {
		let ext = sni_extension("example.com");
		let record = wrap_client_hello(&ext);
		assert_eq!(peek_client_hello_sni(&record[..record.len() - 5]), None);
	}

	#[test]
	fn non_handshake_byte_is_not_sni() {
		assert_eq!(peek_client_hello_sni(&[0x17, 0x03, 0x03, 0, 0]), None);
	}

	#[test]
	fn hello_without_sni_extension_returns_none() {
		let record = wrap_client_hello(&[]);
		assert_eq!(peek_client_hello_sni(&record), None);
	}

	#[tokio::test]
	async fn read_client_hello_prefix_consumes_exactly_the_record() {
		let ext = sni_extension("example.com");
		let record = wrap_client_hello(&ext);
		let trailing = b"leftover application data";
		let mut input = record.clone();
		input.extend_from_slice(trailing);

		let mut cursor = std::io::Cursor::new(input);
		let (consumed, sni) = read_client_hello_prefix(&mut cursor).await.unwrap();
		assert_eq!(sni, Some("example.com".to_string()));
		assert_eq!(consumed, record);

		let mut rest = Vec::new();
		tokio::io::AsyncReadExt::read_to_end(&mut cursor, &mut rest).await.unwrap();
		assert_eq!(rest, trailing);
	}

	#[tokio::test]
	async fn read_client_hello_prefix_consumes_one_byte_for_plaintext() {
		let mut cursor = std::io::Cursor::new(b"GET / HTTP/1.1\r\n".to_vec());
		let (consumed, sni) = read_client_hello_prefix(&mut cursor).await.unwrap();
		assert_eq!(consumed, vec![b'G']);
		assert_eq!(sni, None);
	}
}
