//! Match + dispatch (§4.3). [`select`] is the pure decision function (kept
//! separate from I/O so it's unit-testable against §8's tie-break
//! property); [`run`] executes the winning rule's step pipeline.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;

use super::{CallbackOutcome, Rule, SeenRequest, Step};
use crate::errors::{EngineError, NoMatchDiagnostic};
use crate::http::{Body, RawHeaders, RequestRecord, ResponseRecord};

/// Peeks the body up to `limit` bytes if any of `rule`'s matchers need it,
/// leaving the request's body stream intact for whatever runs next.
async fn peek_body_if_needed<S>(req: &mut RequestRecord, rule: &Rule<S>, limit: usize) -> Option<Bytes> {
	if !rule.matchers.iter().any(|m| m.needs_body()) {
		return None;
	}
	crate::http::inspect_body(&mut req.body, limit).await.ok()
}

/// §4.3 steps 1-2: builds the candidate set (every matcher on a rule must
/// match), then prefers pending rules over completed ones, and within that
/// preference picks the first by priority/insertion order — which the
/// snapshot already encodes, so "first candidate in each pass" is correct.
/// Generic over the step-payload type so both the HTTP and WebSocket rule
/// lists share this matching logic, which never touches `rule.steps`.
///
/// `suggest_changes` gates whether a no-match diagnostic includes the
/// configured rules' summaries (§4.3 step 3: "unless `suggestChanges` is
/// `false`").
pub async fn select<S>(
	snapshot: &[Arc<Rule<S>>],
	req: &mut RequestRecord,
	max_match_body_bytes: usize,
	suggest_changes: bool,
) -> Result<Arc<Rule<S>>, EngineError> {
	let mut pending_candidate = None;
	let mut completed_candidate = None;

	for rule in snapshot {
		let body = peek_body_if_needed(req, rule, max_match_body_bytes).await;
		let mut matched = true;
		for (index, matcher) in rule.matchers.iter().enumerate() {
			match matcher.matches(req, body.as_deref()).await {
				Ok(true) => continue,
				Ok(false) => {
					matched = false;
					break;
				},
				Err(source) => {
					return Err(EngineError::RuleMatcherError {
						kind: matcher.kind(),
						index,
						source,
					});
				},
			}
		}
		if !matched {
			continue;
		}
		if rule.is_pending() {
			pending_candidate.get_or_insert_with(|| rule.clone());
			break;
		} else {
			completed_candidate.get_or_insert_with(|| rule.clone());
		}
	}

	pending_candidate.or(completed_candidate).ok_or_else(|| {
		EngineError::NoMatchingRule(NoMatchDiagnostic {
			method: req.method.to_string(),
			url: req.url.to_string(),
			rule_summaries: suggest_changes.then(|| {
				snapshot
					.iter()
					.map(|r| format!("priority={} matchers={}", r.priority, r.matchers.len()))
					.collect()
			}),
		})
	})
}

/// Runs `rule`'s step pipeline to completion (§4.3, §4.4). Non-terminal
/// steps (`delay`, `waitForOtherRule`) are applied in sequence; the first
/// terminal step produces the response and ends the pipeline.
pub async fn run(rule: &Rule<Step>, mut req: RequestRecord) -> Result<ResponseRecord, EngineError> {
	let mut response = None;
	for step in &rule.steps {
		match step {
			Step::Delay(duration) => {
				tokio::time::sleep(*duration).await;
			},
			Step::WaitForOtherRule => {
				// Nothing to synchronise on at this layer; the engine above
				// decides when to re-dispatch. Treat as a no-op continuation.
			},
			terminal => {
				response = Some(run_terminal(terminal, &mut req).await?);
				break;
			},
		}
	}

	let response = response.ok_or(EngineError::ClientError(
		"rule's step pipeline ended without a terminal step".to_string(),
	))?;

	if rule.record_traffic {
		rule.seen_requests.push(SeenRequest {
			request_id: req.id,
			method: req.method.clone(),
			url: req.url.to_string(),
			status: Some(response.status),
			committed_at: SystemTime::now(),
		});
	}
	if let Some(completion) = &rule.completion {
		completion.record_hit();
	}

	Ok(response)
}

async fn run_terminal(step: &Step, req: &mut RequestRecord) -> Result<ResponseRecord, EngineError> {
	Ok(match step {
		Step::Reply {
			status,
			body,
			headers,
			trailers,
		} => ResponseRecord {
			status: *status,
			status_message: None,
			raw_headers: headers.clone(),
			body: Body::from(body.clone()),
			raw_trailers: trailers.clone(),
			timing: Default::default(),
			tags: Vec::new(),
		},
		Step::Stream { status, headers, .. } => ResponseRecord {
			status: *status,
			status_message: None,
			raw_headers: headers.clone(),
			// The actual source is consumed by the connection writer, which
			// owns the `StreamSource`; by the time a `ResponseRecord` is built
			// here the source has already been handed off. Callers that need
			// the live stream should match on `Step::Stream` upstream of
			// `run` rather than going through this generic terminal path.
			body: Body::empty(),
			raw_trailers: RawHeaders::default(),
			timing: Default::default(),
			tags: Vec::new(),
		},
		Step::Callback(callback) => match callback(req).await.map_err(EngineError::CallbackError)? {
			CallbackOutcome::Response { status, headers, body } => ResponseRecord {
				status,
				status_message: None,
				raw_headers: headers,
				body: Body::from(body),
				raw_trailers: RawHeaders::default(),
				timing: Default::default(),
				tags: Vec::new(),
			},
			CallbackOutcome::Close | CallbackOutcome::Reset => ResponseRecord {
				status: http::StatusCode::from_u16(499).unwrap_or(http::StatusCode::BAD_GATEWAY),
				status_message: None,
				raw_headers: RawHeaders::default(),
				body: Body::empty(),
				raw_trailers: RawHeaders::default(),
				timing: Default::default(),
				tags: vec!["connection-terminated".to_string()],
			},
		},
		Step::Close | Step::Reset | Step::Timeout => ResponseRecord {
			status: http::StatusCode::from_u16(499).unwrap_or(http::StatusCode::BAD_GATEWAY),
			status_message: None,
			raw_headers: RawHeaders::default(),
			body: Body::empty(),
			raw_trailers: RawHeaders::default(),
			timing: Default::default(),
			tags: vec![step.kind().to_string()],
		},
		Step::Forward { target, options } => crate::passthrough::dispatch(
			take_request(req),
			target.clone(),
			&options.passthrough,
		)
		.await
		.map_err(EngineError::Passthrough)?,
		Step::Passthrough(options) => {
			let target = req.destination.clone();
			crate::passthrough::dispatch(take_request(req), target, options)
				.await
				.map_err(EngineError::Passthrough)?
		},
		Step::Delay(_) | Step::WaitForOtherRule => unreachable!("non-terminal steps are filtered out by run()"),
	})
}

/// Moves `req`'s owned fields out, leaving a cheap empty placeholder behind
/// so the caller's `&mut RequestRecord` stays valid. Used only by the two
/// steps (`forward`/`passthrough`) that hand the whole request to another
/// async function taking it by value.
fn take_request(req: &mut RequestRecord) -> RequestRecord {
	RequestRecord {
		id: req.id,
		protocol: req.protocol,
		http_version: req.http_version,
		method: std::mem::replace(&mut req.method, http::Method::GET),
		url: std::mem::replace(&mut req.url, url::Url::parse("http://invalid.invalid").unwrap()),
		path: std::mem::take(&mut req.path),
		raw_headers: std::mem::take(&mut req.raw_headers),
		destination: req.destination.clone(),
		remote_addr: req.remote_addr,
		body: std::mem::replace(&mut req.body, Body::empty()),
		raw_trailers: std::mem::take(&mut req.raw_trailers),
		timing: req.timing.clone(),
		tags: std::mem::take(&mut req.tags),
		matched_rule_id: req.matched_rule_id,
	}
}

#[cfg(test)]
mod tests {
	use std::net::{IpAddr, Ipv4Addr, SocketAddr};

	use super::*;
	use crate::http::{Destination, Protocol, TimingEvents};
	use crate::rules::Matcher;

	fn sample_request(method: http::Method) -> RequestRecord {
		RequestRecord {
			id: uuid::Uuid::new_v4(),
			protocol: Protocol::Http,
			http_version: http::Version::HTTP_11,
			method,
			url: url::Url::parse("http://example.com/a").unwrap(),
			path: "/a".to_string(),
			raw_headers: RawHeaders::default(),
			destination: Destination {
				hostname: "example.com".to_string(),
				port: 80,
			},
			remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234),
			body: Body::empty(),
			raw_trailers: RawHeaders::default(),
			timing: TimingEvents::default(),
			tags: Vec::new(),
			matched_rule_id: None,
		}
	}

	#[tokio::test]
	async fn selects_pending_over_completed_regardless_of_order() {
		let completed: Arc<Rule<Step>> =
			Arc::new(Rule::new(0, vec![Matcher::Method(http::Method::GET)], Vec::new()).with_completion(
				crate::rules::CompletionChecker::Once,
			));
		completed.completion.as_ref().unwrap().record_hit();
		let pending: Arc<Rule<Step>> = Arc::new(Rule::new(0, vec![Matcher::Method(http::Method::GET)], Vec::new()));
		let snapshot = vec![completed.clone(), pending.clone()];

		let mut req = sample_request(http::Method::GET);
		let selected = select(&snapshot, &mut req, 0, true).await.unwrap();
		assert_eq!(selected.id, pending.id);
	}

	#[tokio::test]
	async fn falls_back_to_completed_rule_when_nothing_pending() {
		let completed: Arc<Rule<Step>> =
			Arc::new(Rule::new(0, vec![Matcher::Method(http::Method::GET)], Vec::new()).with_completion(
				crate::rules::CompletionChecker::Once,
			));
		completed.completion.as_ref().unwrap().record_hit();
		let snapshot = vec![completed.clone()];

		let mut req = sample_request(http::Method::GET);
		let selected = select(&snapshot, &mut req, 0, true).await.unwrap();
		assert_eq!(selected.id, completed.id);
	}

	#[tokio::test]
	async fn no_match_reports_diagnostic() {
		let rule: Arc<Rule<Step>> = Arc::new(Rule::new(0, vec![Matcher::Method(http::Method::POST)], Vec::new()));
		let snapshot = vec![rule];
		let mut req = sample_request(http::Method::GET);
		let err = select(&snapshot, &mut req, 0, true).await.unwrap_err();
		assert!(matches!(err, EngineError::NoMatchingRule(_)));
	}

	#[tokio::test]
	async fn no_match_diagnostic_omits_rule_summaries_when_suggest_changes_is_false() {
		let rule: Arc<Rule<Step>> = Arc::new(Rule::new(0, vec![Matcher::Method(http::Method::POST)], Vec::new()));
		let snapshot = vec![rule];
		let mut req = sample_request(http::Method::GET);
		let err = select(&snapshot, &mut req, 0, false).await.unwrap_err();
		match err {
			EngineError::NoMatchingRule(diagnostic) => assert!(diagnostic.rule_summaries.is_none()),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn reply_step_commits_the_configured_response() {
		let rule: Rule<Step> = Rule::new(
			0,
			vec![Matcher::Method(http::Method::GET)],
			vec![Step::Reply {
				status: http::StatusCode::OK,
				body: Bytes::from_static(b"hi"),
				headers: RawHeaders::default(),
				trailers: RawHeaders::default(),
			}],
		);
		let req = sample_request(http::Method::GET);
		let resp = run(&rule, req).await.unwrap();
		assert_eq!(resp.status, http::StatusCode::OK);
	}
}
