use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A list of buffers, cheap to append to but not cheap to clone. Lifted from
/// the `http_body` crate's internal helper of the same name (enrichment from
/// the other example repo's `http/buflist.rs`, since the teacher doesn't
/// carry this file).
#[derive(Clone, Debug, Default)]
pub struct BufList<T = Bytes> {
	bufs: VecDeque<T>,
}

impl<T: Buf> BufList<T> {
	pub fn push(&mut self, buf: T) {
		debug_assert!(buf.has_remaining());
		self.bufs.push_back(buf);
	}

	pub fn pop_front(&mut self) -> Option<T> {
		self.bufs.pop_front()
	}
}

impl<T: Buf> Buf for BufList<T> {
	fn remaining(&self) -> usize {
		self.bufs.iter().map(Buf::remaining).sum()
	}

	fn chunk(&self) -> &[u8] {
		self.bufs.front().map(Buf::chunk).unwrap_or_default()
	}

	fn chunks_vectored<'t>(&'t self, dst: &mut [IoSlice<'t>]) -> usize {
		if dst.is_empty() {
			return 0;
		}
		let mut vecs = 0;
		for buf in &self.bufs {
			vecs += buf.chunks_vectored(&mut dst[vecs..]);
			if vecs == dst.len() {
				break;
			}
		}
		vecs
	}

	fn advance(&mut self, mut cnt: usize) {
		while cnt > 0 {
			{
				let front = &mut self.bufs[0];
				let rem = front.remaining();
				if rem > cnt {
					front.advance(cnt);
					return;
				} else {
					front.advance(rem);
					cnt -= rem;
				}
			}
			self.bufs.pop_front();
		}
	}

	fn has_remaining(&self) -> bool {
		self.bufs.iter().any(Buf::has_remaining)
	}

	fn copy_to_bytes(&mut self, len: usize) -> Bytes {
		match self.bufs.front_mut() {
			Some(front) if front.remaining() == len => {
				let b = front.copy_to_bytes(len);
				self.bufs.pop_front();
				b
			},
			Some(front) if front.remaining() > len => front.copy_to_bytes(len),
			_ => {
				let rem = self.remaining();
				assert!(len <= rem, "`len` greater than remaining");
				let mut bm = BytesMut::with_capacity(len);
				if rem == len {
					bm.put(self);
				} else {
					bm.put(self.take(len));
				}
				bm.freeze()
			},
		}
	}
}
