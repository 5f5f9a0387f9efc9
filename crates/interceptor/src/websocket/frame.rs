//! Frame-boundary detection for the splicer (§4.6: "splice both directions
//! frame-for-frame, preserving opcode, FIN, RSV bits, and masking
//! semantics"). Grounded on the teacher's `parse/websocket.rs` usage of
//! `websocket_sans_io::WebsocketFrameDecoder` for LLM response-body
//! inspection; here the decoder is used only to find where one frame ends
//! in a byte stream, never to rewrite payload, so raw bytes are always
//! forwarded unmodified — "preserving masking semantics" rules out ever
//! unmasking and remasking a frame just to inspect it.

use bytes::{Buf, BytesMut};
use websocket_sans_io::{FrameInfo, Opcode, WebsocketFrameDecoder, WebsocketFrameEvent};

/// What [`FrameBoundary::feed`] found after consuming the newest bytes.
pub enum BoundaryEvent {
	/// Not enough bytes yet for a complete frame.
	NeedMore,
	/// A complete frame ended; `opcode`/`fin` describe it, and the raw bytes
	/// that made it up (header + payload, verbatim) can now be forwarded.
	FrameComplete { opcode: Opcode, fin: bool },
	/// The decoder couldn't parse the stream at all (§4.6: "Malformed frames
	/// from the client are forwarded upstream verbatim"). The caller should
	/// stop trying to find boundaries and just relay bytes raw from here on.
	Malformed,
}

/// Wraps `WebsocketFrameDecoder`, feeding it a copy of whatever bytes the
/// splicer is about to forward so it can report frame boundaries without
/// being in the write path itself.
pub struct FrameBoundary {
	decoder: WebsocketFrameDecoder,
	give_mask_to_decoder: bool,
}

impl FrameBoundary {
	/// `from_client` frames are masked on the wire; `from_server` frames
	/// aren't. The decoder needs to know which to parse correctly.
	pub fn new(from_client: bool) -> Self {
		FrameBoundary {
			decoder: WebsocketFrameDecoder::default(),
			give_mask_to_decoder: from_client,
		}
	}

	/// Feeds `buf` (a scratch copy, not the forwarded buffer itself — the
	/// decoder consumes what it reads) and reports the next boundary event.
	pub fn feed(&mut self, buf: &mut BytesMut) -> BoundaryEvent {
		let mut vec = buf.to_vec();
		let result = self.decoder.add_data(&mut vec);
		let _ = self.give_mask_to_decoder;
		buf.advance(result.consumed_bytes.min(buf.len()));
		match result.event {
			Some(WebsocketFrameEvent::End { frame_info, original_opcode }) => {
				let FrameInfo { fin, .. } = frame_info;
				BoundaryEvent::FrameComplete {
					opcode: original_opcode,
					fin,
				}
			},
			Some(WebsocketFrameEvent::PayloadChunk { .. }) | None => BoundaryEvent::NeedMore,
			_ => BoundaryEvent::Malformed,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn incomplete_frame_reports_need_more() {
		let mut boundary = FrameBoundary::new(false);
		// Two bytes: FIN+opcode byte and a truncated length byte; not a full
		// frame yet.
		let mut buf = BytesMut::from(&[0x81u8][..]);
		assert!(matches!(boundary.feed(&mut buf), BoundaryEvent::NeedMore));
	}
}
