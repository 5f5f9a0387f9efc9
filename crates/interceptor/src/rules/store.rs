//! Rule storage (§5 "The rule list uses copy-on-write"). Grounded on the
//! teacher's `arc_swap::ArcSwap` usage in `client/dns.rs`: readers (the
//! per-request match loop) never block a writer (an endpoint being
//! registered or torn down), and vice versa. HTTP and WebSocket rules get
//! independent lists (§3 "Session").
//!
//! `FALLBACK`/`DEFAULT`/`HIGH` mirror §3's priority-constant ordering
//! (`FALLBACK < DEFAULT < HIGH`); ties within a priority band resolve by
//! insertion order, which the store preserves by never reordering its
//! `Vec` on append.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::Rule;

pub const PRIORITY_FALLBACK: i64 = i64::MIN;
pub const PRIORITY_DEFAULT: i64 = 0;
pub const PRIORITY_HIGH: i64 = i64::MAX;

/// A copy-on-write, priority-sorted, insertion-order-stable list of rules
/// for one traffic kind. `S` is the step-payload type (`Step` for the HTTP
/// list, `crate::websocket::WebsocketStep` for the WebSocket list).
pub struct RuleStore<S> {
	rules: ArcSwap<Vec<Arc<Rule<S>>>>,
}

impl<S> RuleStore<S> {
	pub fn new() -> Self {
		RuleStore {
			rules: ArcSwap::from_pointee(Vec::new()),
		}
	}

	/// A consistent, lock-free snapshot for the match loop to iterate. The
	/// snapshot is already sorted by priority descending with insertion order
	/// preserved within a band (§4.3 step 2, §8's tie-break property).
	pub fn snapshot(&self) -> Arc<Vec<Arc<Rule<S>>>> {
		self.rules.load_full()
	}

	/// Appends a rule, re-sorting by priority (stable, so insertion order
	/// within a band is untouched).
	pub fn insert(&self, rule: Rule<S>) -> Arc<Rule<S>> {
		let rule = Arc::new(rule);
		let inserted = rule.clone();
		self.rules.rcu(|current| {
			let mut next = (**current).clone();
			next.push(rule.clone());
			next.sort_by_key(|r| std::cmp::Reverse(r.priority));
			next
		});
		inserted
	}

	/// Removes a rule by id. Per §9's retained Open Question, completed rules
	/// are never auto-removed by the engine itself — this exists only for
	/// explicit endpoint teardown requested by the caller.
	pub fn remove(&self, id: uuid::Uuid) {
		self.rules.rcu(|current| {
			let mut next = (**current).clone();
			next.retain(|r| r.id != id);
			next
		});
	}

	pub fn len(&self) -> usize {
		self.rules.load().len()
	}
}

impl<S> Default for RuleStore<S> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rules::{Matcher, Step};

	fn rule(priority: i64) -> Rule<Step> {
		Rule::new(priority, vec![Matcher::Host("example.com".to_string())], Vec::new())
	}

	#[test]
	fn snapshot_is_sorted_by_priority_descending() {
		let store: RuleStore<Step> = RuleStore::new();
		store.insert(rule(PRIORITY_DEFAULT));
		store.insert(rule(PRIORITY_HIGH));
		store.insert(rule(PRIORITY_FALLBACK));
		let snap = store.snapshot();
		assert_eq!(snap[0].priority, PRIORITY_HIGH);
		assert_eq!(snap[2].priority, PRIORITY_FALLBACK);
	}

	#[test]
	fn ties_preserve_insertion_order() {
		let store: RuleStore<Step> = RuleStore::new();
		let a = store.insert(rule(PRIORITY_DEFAULT));
		let b = store.insert(rule(PRIORITY_DEFAULT));
		let snap = store.snapshot();
		assert_eq!(snap[0].id, a.id);
		assert_eq!(snap[1].id, b.id);
	}

	#[test]
	fn remove_drops_the_rule() {
		let store: RuleStore<Step> = RuleStore::new();
		let a = store.insert(rule(PRIORITY_DEFAULT));
		store.remove(a.id);
		assert_eq!(store.len(), 0);
	}
}
