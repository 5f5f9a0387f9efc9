//! Body codec: Content-Encoding aware compression and decompression,
//! grounded on the teacher's `http/compression/mod.rs`, with the error type
//! folded into [`crate::errors::CodecError`] instead of a module-local enum.

use async_compression::tokio::bufread::{
	BrotliDecoder, BrotliEncoder, GzipDecoder, GzipEncoder, ZlibDecoder, ZlibEncoder, ZstdDecoder,
	ZstdEncoder,
};
use bytes::Bytes;
use futures_util::TryStreamExt;
use headers::{ContentEncoding, Header};
use http_body::Body;
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::errors::CodecError;

const GZIP: &str = "gzip";
const DEFLATE: &str = "deflate";
const BR: &str = "br";
const ZSTD: &str = "zstd";

enum EncodingDecision {
	None,
	Single(&'static str),
	Multiple,
	Unsupported,
}

/// Detects which single supported encoding is present in the Content-Encoding
/// header. `identity` is treated as a no-op (RFC 9110 §8.4.1), so
/// `"identity, gzip"` is equivalent to `"gzip"`. More than one non-identity
/// token means chain decoding, which we don't support.
fn detect_encoding(ce: &ContentEncoding) -> EncodingDecision {
	let mut values = Vec::new();
	ce.encode(&mut values);
	let Some(value) = values.first() else {
		return EncodingDecision::None;
	};
	let Ok(raw) = value.to_str() else {
		return EncodingDecision::Unsupported;
	};

	let mut supported_count = 0;
	let mut single_supported = None;
	let mut has_unknown = false;

	for token in raw.split(',') {
		let token = token.trim();
		if token.is_empty() {
			continue;
		}
		if token.eq_ignore_ascii_case("identity") {
			continue;
		}

		if token.eq_ignore_ascii_case(GZIP) {
			supported_count += 1;
			single_supported = Some(GZIP);
		} else if token.eq_ignore_ascii_case(DEFLATE) {
			supported_count += 1;
			single_supported = Some(DEFLATE);
		} else if token.eq_ignore_ascii_case(BR) {
			supported_count += 1;
			single_supported = Some(BR);
		} else if token.eq_ignore_ascii_case(ZSTD) {
			supported_count += 1;
			single_supported = Some(ZSTD);
		} else {
			has_unknown = true;
		}
	}

	if has_unknown {
		return EncodingDecision::Unsupported;
	}
	if supported_count == 0 {
		return EncodingDecision::None;
	}
	if supported_count > 1 {
		return EncodingDecision::Multiple;
	}
	match single_supported {
		Some(enc) => EncodingDecision::Single(enc),
		None => EncodingDecision::Unsupported,
	}
}

/// Decompresses a streaming body, returning a body that yields decompressed
/// chunks without buffering the whole thing. Used for the websocket/SSE-style
/// passthrough path where a transform doesn't need the full body.
pub fn decompress_body<B>(
	body: B,
	encoding: Option<&ContentEncoding>,
) -> Result<(axum_core::body::Body, Option<&'static str>), CodecError>
where
	B: Body<Data = Bytes> + Send + Unpin + 'static,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	match encoding {
		None => Ok((axum_core::body::Body::new(body), None)),
		Some(ce) => match detect_encoding(ce) {
			EncodingDecision::Single(enc) => {
				decompress_body_with_encoding(body, enc).map(|b| (b, Some(enc)))
			},
			EncodingDecision::None => Ok((axum_core::body::Body::new(body), None)),
			EncodingDecision::Multiple | EncodingDecision::Unsupported => {
				Err(CodecError::UnsupportedEncoding(describe(encoding)))
			},
		},
	}
}

fn describe(ce: Option<&ContentEncoding>) -> String {
	let mut values = Vec::new();
	if let Some(ce) = ce {
		ce.encode(&mut values);
	}
	values
		.first()
		.and_then(|v| v.to_str().ok())
		.unwrap_or("<unparseable>")
		.to_string()
}

fn decompress_body_with_encoding<B>(
	body: B,
	encoding: &str,
) -> Result<axum_core::body::Body, CodecError>
where
	B: Body + Send + Unpin + 'static,
	B::Data: Send,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let byte_stream = body.into_data_stream().map_err(std::io::Error::other);
	let stream_reader = BufReader::new(StreamReader::new(byte_stream));

	let decoder: Box<dyn AsyncRead + Unpin + Send> = match encoding {
		GZIP => Box::new(GzipDecoder::new(stream_reader)),
		DEFLATE => Box::new(ZlibDecoder::new(stream_reader)),
		BR => Box::new(BrotliDecoder::new(stream_reader)),
		ZSTD => Box::new(ZstdDecoder::new(stream_reader)),
		_ => return Err(CodecError::UnsupportedEncoding(encoding.to_string())),
	};

	Ok(axum_core::body::Body::from_stream(ReaderStream::new(
		decoder,
	)))
}

/// Buffers a body into `Bytes`, decompressing along the way if needed, and
/// enforcing `limit` on the *decompressed* size (§4.4 "decompression bomb"
/// guard — a transform must never see more than the configured body cap).
pub async fn to_bytes_with_decompression(
	body: axum_core::body::Body,
	encoding: Option<&ContentEncoding>,
	limit: usize,
) -> Result<(Option<&'static str>, Bytes), CodecError> {
	match encoding {
		None => Ok((None, read_body_with_limit(body, limit).await?)),
		Some(ce) => match detect_encoding(ce) {
			EncodingDecision::Single(enc) => Ok((Some(enc), decode_body(body, enc, limit).await?)),
			EncodingDecision::None => Ok((None, read_body_with_limit(body, limit).await?)),
			EncodingDecision::Multiple | EncodingDecision::Unsupported => {
				Err(CodecError::UnsupportedEncoding(describe(encoding)))
			},
		},
	}
}

/// Re-encodes a full buffer for a transform that rewrote a decoded body and
/// wants the original `Content-Encoding` restored before it goes back on the
/// wire.
pub async fn encode_body(body: &[u8], encoding: &str) -> Result<Bytes, CodecError> {
	let reader = BufReader::new(body);

	let encoder: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match encoding {
		GZIP => Box::new(GzipEncoder::new(reader)),
		DEFLATE => Box::new(ZlibEncoder::new(reader)),
		BR => Box::new(BrotliEncoder::new(reader)),
		ZSTD => Box::new(ZstdEncoder::new(reader)),
		_ => return Err(CodecError::UnsupportedEncoding(encoding.to_string())),
	};

	read_to_bytes(encoder, usize::MAX).await
}

async fn decode_body<B>(body: B, encoding: &str, limit: usize) -> Result<Bytes, CodecError>
where
	B: Body<Data = Bytes> + Send + Unpin + 'static,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let decompressed = decompress_body_with_encoding(body, encoding)?;
	read_body_with_limit(decompressed, limit).await
}

async fn read_to_bytes<R>(mut reader: R, limit: usize) -> Result<Bytes, CodecError>
where
	R: AsyncRead + Unpin,
{
	let initial_capacity = if limit == usize::MAX {
		8192
	} else {
		limit.min(65536)
	};
	let mut buffer = bytes::BytesMut::with_capacity(initial_capacity);
	loop {
		let n = reader.read_buf(&mut buffer).await?;
		if buffer.len() > limit {
			return Err(CodecError::LimitExceeded);
		}
		if n == 0 {
			break;
		}
	}
	Ok(buffer.freeze())
}

async fn read_body_with_limit(
	body: axum_core::body::Body,
	limit: usize,
) -> Result<Bytes, CodecError> {
	use http_body_util::BodyExt as _;
	let collected = body
		.collect()
		.await
		.map_err(|e| CodecError::Body(axum_core::Error::new(e)))?;
	let bytes = collected.to_bytes();
	if bytes.len() > limit {
		return Err(CodecError::LimitExceeded);
	}
	Ok(bytes)
}

#[cfg(test)]
mod tests {
	use headers::HeaderMapExt;
	use http_body_util::BodyExt;

	use super::*;

	fn make_content_encoding(enc: &str) -> ContentEncoding {
		let mut headers = http::HeaderMap::new();
		headers.insert(
			http::header::CONTENT_ENCODING,
			http::HeaderValue::from_str(enc).unwrap(),
		);
		headers.typed_get::<ContentEncoding>().unwrap()
	}

	#[tokio::test]
	async fn unsupported_encoding_is_rejected() {
		let body = axum_core::body::Body::from("hello");
		let ce = make_content_encoding("unsupported");
		let result = decompress_body(body, Some(&ce));
		assert!(matches!(result, Err(CodecError::UnsupportedEncoding(_))));
	}

	#[tokio::test]
	async fn identity_is_passthrough() {
		let body = axum_core::body::Body::from("hello");
		let ce = make_content_encoding("identity");
		let (decoded, enc) = to_bytes_with_decompression(body, Some(&ce), 100)
			.await
			.unwrap();
		assert!(enc.is_none());
		assert_eq!(decoded, Bytes::from_static(b"hello"));
	}

	#[tokio::test]
	async fn multiple_encodings_are_rejected() {
		let body = axum_core::body::Body::from("hello");
		let ce = make_content_encoding("gzip, br");
		let result = to_bytes_with_decompression(body, Some(&ce), 100).await;
		assert!(matches!(result, Err(CodecError::UnsupportedEncoding(_))));
	}

	#[tokio::test]
	async fn identity_gzip_is_treated_as_gzip() {
		let original = b"hello world";
		let compressed = encode_body(original, GZIP).await.unwrap();
		let body = axum_core::body::Body::from(compressed);
		let ce = make_content_encoding("identity, gzip");
		let (decompressed_body, enc) = decompress_body(body, Some(&ce)).unwrap();
		let bytes = decompressed_body.collect().await.unwrap().to_bytes();
		assert_eq!(bytes, original.as_slice());
		assert_eq!(enc, Some(GZIP));
	}

	#[tokio::test]
	async fn round_trip_gzip() {
		let original = b"roundtrip payload for gzip";
		let compressed = encode_body(original, GZIP).await.unwrap();
		let body = axum_core::body::Body::from(compressed);
		let ce = make_content_encoding(GZIP);
		let (enc, bytes) = to_bytes_with_decompression(body, Some(&ce), 1024)
			.await
			.unwrap();
		assert_eq!(bytes, original.as_slice());
		assert_eq!(enc, Some(GZIP));
	}

	#[tokio::test]
	async fn round_trip_deflate() {
		let original = b"roundtrip payload for deflate";
		let compressed = encode_body(original, DEFLATE).await.unwrap();
		let body = axum_core::body::Body::from(compressed);
		let ce = make_content_encoding(DEFLATE);
		let (enc, bytes) = to_bytes_with_decompression(body, Some(&ce), 1024)
			.await
			.unwrap();
		assert_eq!(bytes, original.as_slice());
		assert_eq!(enc, Some(DEFLATE));
	}

	#[tokio::test]
	async fn round_trip_brotli() {
		let original = b"roundtrip payload for brotli";
		let compressed = encode_body(original, BR).await.unwrap();
		let body = axum_core::body::Body::from(compressed);
		let ce = make_content_encoding(BR);
		let (enc, bytes) = to_bytes_with_decompression(body, Some(&ce), 1024)
			.await
			.unwrap();
		assert_eq!(bytes, original.as_slice());
		assert_eq!(enc, Some(BR));
	}

	#[tokio::test]
	async fn decompressed_size_over_limit_is_rejected() {
		let original = b"this payload will exceed the tiny limit after decompression";
		let compressed = encode_body(original, GZIP).await.unwrap();
		let body = axum_core::body::Body::from(compressed);
		let ce = make_content_encoding(GZIP);
		let result = to_bytes_with_decompression(body, Some(&ce), 10).await;
		assert!(matches!(result, Err(CodecError::LimitExceeded)));
	}
}
