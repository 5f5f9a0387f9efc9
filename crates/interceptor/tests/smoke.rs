//! End-to-end smoke tests driving a real `Session` over plaintext TCP,
//! mirroring the teacher's black-box-over-a-bound-listener style of
//! integration test (see `DESIGN.md` for why these replace the teacher's
//! gateway-specific test harness).

use std::time::Duration;

use bytes::Bytes;
use interceptor::config::Config;
use interceptor::http::RawHeaders;
use interceptor::rules::{Matcher, Rule, Step};
use interceptor::session::Session;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Sends a bare HTTP/1.1 request over `stream` and returns the full response
/// (status line + headers + body) as a string. The client always asks for
/// `Connection: close` so the server-side socket closes once the response is
/// flushed, which is what lets this read-to-EOF rather than needing to parse
/// `Content-Length` itself.
async fn send_request(port: u16, path: &str, host: &str) -> String {
	let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
	let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
	stream.write_all(request.as_bytes()).await.unwrap();

	let mut response = Vec::new();
	tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
		.await
		.expect("response within timeout")
		.unwrap();
	String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn reply_step_answers_a_matched_request() {
	let session = Session::new(Config::default()).unwrap();
	let mut headers = RawHeaders::default();
	headers.push("x-served-by", "rule-engine");
	session.add_http_rule(Rule::new(
		0,
		vec![Matcher::PathExact("/hello".to_string())],
		vec![Step::Reply {
			status: http::StatusCode::OK,
			body: Bytes::from_static(b"hi there"),
			headers,
			trailers: RawHeaders::default(),
		}],
	));

	let listening = session.start().await.unwrap();
	let response = send_request(listening.local_addr().port(), "/hello", "example.com").await;

	assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
	assert!(response.contains("x-served-by: rule-engine"));
	assert!(response.ends_with("hi there"));

	listening.stop().await;
}

#[tokio::test]
async fn unmatched_request_gets_a_diagnostic_503() {
	let session = Session::new(Config::default()).unwrap();
	let listening = session.start().await.unwrap();

	let response = send_request(listening.local_addr().port(), "/nothing-matches", "example.com").await;
	assert!(response.starts_with("HTTP/1.1 503"), "unexpected response: {response}");

	listening.stop().await;
}

#[tokio::test]
async fn higher_priority_rule_wins_over_an_earlier_insertion() {
	let session = Session::new(Config::default()).unwrap();
	session.add_http_rule(Rule::new(
		0,
		vec![Matcher::PathExact("/race".to_string())],
		vec![Step::Reply {
			status: http::StatusCode::OK,
			body: Bytes::from_static(b"low-priority"),
			headers: RawHeaders::default(),
			trailers: RawHeaders::default(),
		}],
	));
	session.add_http_rule(Rule::new(
		10,
		vec![Matcher::PathExact("/race".to_string())],
		vec![Step::Reply {
			status: http::StatusCode::OK,
			body: Bytes::from_static(b"high-priority"),
			headers: RawHeaders::default(),
			trailers: RawHeaders::default(),
		}],
	));

	let listening = session.start().await.unwrap();
	let response = send_request(listening.local_addr().port(), "/race", "example.com").await;
	assert!(response.ends_with("high-priority"), "unexpected response: {response}");

	listening.stop().await;
}

#[tokio::test]
async fn forward_to_a_closed_port_surfaces_as_bad_gateway() {
	let session = Session::new(Config::default()).unwrap();
	// Nothing is listening on this port, so the passthrough dial fails.
	let dead_listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
	let dead_port = dead_listener.local_addr().unwrap().port();
	drop(dead_listener);

	session.add_http_rule(Rule::new(
		0,
		vec![Matcher::PathExact("/forward".to_string())],
		vec![Step::Forward {
			target: interceptor::http::Destination {
				hostname: "127.0.0.1".to_string(),
				port: dead_port,
			},
			options: interceptor::passthrough::ForwardOptions::default(),
		}],
	));

	let listening = session.start().await.unwrap();
	let response = send_request(listening.local_addr().port(), "/forward", "example.com").await;
	assert!(response.starts_with("HTTP/1.1 502"), "unexpected response: {response}");

	listening.stop().await;
}
