//! Steps (§3 "Step", §4.4 "Step executors"). Non-terminal steps mutate the
//! in-flight request/response and hand control to the next step; the
//! terminal step commits a response (or tears the connection down) and ends
//! the pipeline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::http::{Destination, RawHeaders, RequestRecord};
use crate::passthrough::{ForwardOptions, PassthroughOptions};

/// What a `callback` step's caller-supplied function may return (§4.4).
pub enum CallbackOutcome {
	Response {
		status: http::StatusCode,
		headers: RawHeaders,
		body: Bytes,
	},
	Close,
	Reset,
}

pub type StepCallback = Arc<
	dyn Fn(&RequestRecord) -> Pin<Box<dyn Future<Output = anyhow::Result<CallbackOutcome>> + Send>>
		+ Send
		+ Sync,
>;

/// A lazy, possibly-infinite byte source for `stream` steps. Cancellation
/// (dropping the stream) must close the underlying source.
pub type StreamSource = BoxStream<'static, std::io::Result<Bytes>>;

pub enum Step {
	Reply {
		status: http::StatusCode,
		body: Bytes,
		headers: RawHeaders,
		trailers: RawHeaders,
	},
	Stream {
		status: http::StatusCode,
		headers: RawHeaders,
		source: StreamSource,
	},
	Callback(StepCallback),
	Close,
	Reset,
	Timeout,
	Forward {
		target: Destination,
		options: ForwardOptions,
	},
	Passthrough(PassthroughOptions),
	Delay(Duration),
	WaitForOtherRule,
}

impl Step {
	pub fn is_terminal(&self) -> bool {
		!matches!(self, Step::Delay(_) | Step::WaitForOtherRule)
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Step::Reply { .. } => "reply",
			Step::Stream { .. } => "stream",
			Step::Callback(_) => "callback",
			Step::Close => "close",
			Step::Reset => "reset",
			Step::Timeout => "timeout",
			Step::Forward { .. } => "forward",
			Step::Passthrough(_) => "passthrough",
			Step::Delay(_) => "delay",
			Step::WaitForOtherRule => "wait-for-other-rule",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_terminal_steps_end_the_pipeline() {
		assert!(Step::Close.is_terminal());
		assert!(Step::Reset.is_terminal());
		assert!(!Step::Delay(Duration::from_millis(1)).is_terminal());
		assert!(!Step::WaitForOtherRule.is_terminal());
	}
}
