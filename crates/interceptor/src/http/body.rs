//! The body type shared by request/response records, plus the
//! partial-buffering helper used to peek a body without consuming it for
//! downstream readers (grounded on the teacher's `http/peekbody.rs`).

use std::cmp;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;

use crate::http::buflist::BufList;

pub type Body = axum_core::body::Body;
pub type Error = axum_core::Error;

pin_project! {
	struct PartiallyBufferedBody {
		buffer: BufList,
		trailers: Option<HeaderMap>,
		#[pin]
		inner: Body,
	}
}

impl http_body::Body for PartiallyBufferedBody {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		if let Some(chunk) = self.buffer.pop_front() {
			return Poll::Ready(Some(Ok(Frame::data(chunk))));
		}
		if let Some(trailers) = self.trailers.take() {
			return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
		}
		let this = self.project();
		this.inner.poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		!self.buffer.has_remaining() && self.inner.is_end_stream() && self.trailers.is_none()
	}

	fn size_hint(&self) -> SizeHint {
		let buffered = self.buffer.remaining() as u64;
		let mut rest = self.inner.size_hint();
		if let Some(upper) = rest.upper() {
			rest.set_upper(upper.saturating_add(buffered));
		}
		rest.set_lower(rest.lower() + buffered);
		rest
	}
}

/// Peeks up to `limit` bytes from `body` without losing any data: the body
/// is replaced in place with an equivalent one that replays the peeked
/// prefix before continuing with whatever was left unread. Used by the rule
/// engine's body-content matchers (`body-includes`, `json-body-*`, ...),
/// which must inspect the body without preventing the passthrough/forward
/// path from later reading it in full.
pub async fn inspect_body(body: &mut Body, limit: usize) -> Result<Bytes, Error> {
	let mut orig = std::mem::replace(body, Body::empty());
	let mut buffer = BufList::default();
	let mut trailers: Option<HeaderMap> = None;
	let mut want = limit;
	loop {
		match orig.frame().await {
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					let want_this_read = cmp::min(data.len(), want);
					if want_this_read == 0 {
						break;
					}
					buffer.push(data.clone());
					want -= want_this_read;
					if want == 0 {
						break;
					}
				} else {
					trailers = frame.into_trailers().ok();
				}
			},
			Some(Err(err)) => return Err(err),
			None => break,
		}
	}

	let mut preview = buffer.clone();
	let ret = preview.copy_to_bytes(cmp::min(buffer.remaining(), limit));
	*body = Body::new(PartiallyBufferedBody {
		buffer,
		trailers,
		inner: orig,
	});
	Ok(ret)
}

/// Reads a body to completion, rejecting it once the accumulated size
/// exceeds `limit` (§8 "maxBodySize" boundary behaviour).
pub async fn read_body_with_limit(body: Body, limit: usize) -> Result<Bytes, Error> {
	use http_body_util::Limited;
	match Limited::new(body, limit).collect().await {
		Ok(collected) => Ok(collected.to_bytes()),
		Err(e) => Err(Error::new(e)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn read_all(body: Body) -> Bytes {
		read_body_with_limit(body, 1_048_576).await.unwrap()
	}

	#[tokio::test]
	async fn inspect_empty_body() {
		let mut original = Body::empty();
		let inspected = inspect_body(&mut original, 100).await.unwrap();
		assert!(inspected.is_empty());
		assert!(read_all(original).await.is_empty());
	}

	#[tokio::test]
	async fn inspect_partial_body_preserves_remainder() {
		let payload = Bytes::from_iter(std::iter::repeat_n(b'a', 100));
		let mut original = Body::from(payload.clone());
		let inspected = inspect_body(&mut original, 10).await.unwrap();
		assert_eq!(inspected, payload.slice(0..10));
		assert_eq!(read_all(original).await, payload);
	}

	#[tokio::test]
	async fn read_body_with_limit_rejects_oversized() {
		let body = Body::from(vec![0u8; 20]);
		let err = read_body_with_limit(body, 10).await;
		assert!(err.is_err());
	}
}
