//! Rules (§3 "Rule", §4.3 "Rule engine"). A `Rule` bundles an ordered
//! matcher list, an optional completion checker, and a non-empty step
//! pipeline; [`engine::select`] and [`engine::run`] implement the matching
//! and execution algorithm, and [`store::RuleStore`] holds the copy-on-write
//! list a session runs against.

pub mod completion;
pub mod engine;
pub mod matcher;
pub mod steps;
pub mod store;

use std::sync::Mutex;
use std::time::SystemTime;

use uuid::Uuid;

pub use completion::{CompletionChecker, CompletionState};
pub use matcher::{CallbackMatcher, Matcher};
pub use steps::{CallbackOutcome, Step, StepCallback, StreamSource};

/// Default capacity of a rule's `seenRequests` ring (§4.3: "capacity
/// implementation-defined, typically 100").
pub const SEEN_REQUESTS_CAPACITY: usize = 100;

/// One entry in a rule's `seenRequests` ring: enough to inspect after the
/// fact without holding onto the live request/response bodies.
#[derive(Clone, Debug)]
pub struct SeenRequest {
	pub request_id: Uuid,
	pub method: http::Method,
	pub url: String,
	pub status: Option<http::StatusCode>,
	pub committed_at: SystemTime,
}

/// A bounded FIFO ring, oldest entries dropped first once full.
pub struct SeenRequestRing {
	capacity: usize,
	entries: Mutex<std::collections::VecDeque<SeenRequest>>,
}

impl SeenRequestRing {
	pub fn new(capacity: usize) -> Self {
		SeenRequestRing {
			capacity,
			entries: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
		}
	}

	pub fn push(&self, entry: SeenRequest) {
		let mut entries = self.entries.lock().unwrap();
		if entries.len() >= self.capacity {
			entries.pop_front();
		}
		entries.push_back(entry);
	}

	pub fn snapshot(&self) -> Vec<SeenRequest> {
		self.entries.lock().unwrap().iter().cloned().collect()
	}
}

/// A rule: matchers decide eligibility, the completion checker decides
/// pending-vs-completed, and the step pipeline decides what happens to a
/// matched request (§3 "Rule"). Generic over the step-payload type so the
/// HTTP rule list (`Rule<Step>`) and the WebSocket rule list
/// (`Rule<crate::websocket::WebsocketStep>`) can share matching, priority,
/// and completion-tracking machinery (§3 "Session": independent lists).
pub struct Rule<S> {
	pub id: Uuid,
	/// Larger wins; ties break by insertion order (`store::RuleStore`
	/// preserves that order within a priority band).
	pub priority: i64,
	pub matchers: Vec<Matcher>,
	pub completion: Option<CompletionState>,
	pub steps: Vec<S>,
	pub record_traffic: bool,
	pub seen_requests: SeenRequestRing,
}

impl<S> Rule<S> {
	pub fn new(priority: i64, matchers: Vec<Matcher>, steps: Vec<S>) -> Self {
		Rule {
			id: Uuid::new_v4(),
			priority,
			matchers,
			completion: None,
			steps,
			record_traffic: false,
			seen_requests: SeenRequestRing::new(SEEN_REQUESTS_CAPACITY),
		}
	}

	pub fn with_completion(mut self, checker: CompletionChecker) -> Self {
		self.completion = Some(CompletionState::new(checker));
		self
	}

	pub fn with_record_traffic(mut self, record: bool) -> Self {
		self.record_traffic = record;
		self
	}

	/// A completed rule is one whose completion checker reports done; a rule
	/// with no checker at all is always pending (§3 "Completion checker").
	pub fn is_pending(&self) -> bool {
		self.completion.as_ref().map(|c| c.is_pending()).unwrap_or(true)
	}
}

/// The caller-visible handle returned when a rule is registered (§3
/// "Endpoint handle"): a 1:1 view onto one `Rule`, exposing only what a
/// caller needs to introspect it after the fact.
#[derive(Clone)]
pub struct Endpoint<S> {
	rule: std::sync::Arc<Rule<S>>,
}

impl<S> Endpoint<S> {
	pub fn new(rule: std::sync::Arc<Rule<S>>) -> Self {
		Endpoint { rule }
	}

	pub fn id(&self) -> Uuid {
		self.rule.id
	}

	/// Bounded ring of completed requests, populated only if the rule was
	/// created with `recordTraffic=true`; otherwise always empty.
	pub fn seen_requests(&self) -> Vec<SeenRequest> {
		if self.rule.record_traffic {
			self.rule.seen_requests.snapshot()
		} else {
			Vec::new()
		}
	}

	pub fn is_pending(&self) -> bool {
		self.rule.is_pending()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn endpoint_without_record_traffic_reports_no_history() {
		let store = store::RuleStore::new();
		let rule: Rule<Step> = Rule::new(0, vec![Matcher::Port(80)], Vec::new());
		let inserted = store.insert(rule);
		let endpoint = Endpoint::new(inserted);
		assert!(endpoint.seen_requests().is_empty());
		assert!(endpoint.is_pending());
	}

	#[test]
	fn rule_without_a_checker_is_always_pending() {
		let rule: Rule<Step> = Rule::new(0, vec![Matcher::Port(80)], Vec::new());
		assert!(rule.is_pending());
	}

	#[test]
	fn seen_requests_ring_drops_oldest_past_capacity() {
		let ring = SeenRequestRing::new(2);
		for i in 0..3u32 {
			ring.push(SeenRequest {
				request_id: Uuid::new_v4(),
				method: http::Method::GET,
				url: format!("http://example.com/{i}"),
				status: None,
				committed_at: SystemTime::now(),
			});
		}
		let snap = ring.snapshot();
		assert_eq!(snap.len(), 2);
		assert!(snap[0].url.ends_with('1'));
	}
}
