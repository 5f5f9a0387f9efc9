//! Event distribution (§4.7). A lock-free-for-publishers fan-out bus with
//! one bounded queue per subscriber; a slow subscriber gets its queue
//! dropped-from rather than ever blocking request handling, per §9 "Event
//! bus dropping policy". Grounded on the teacher's `tokio::sync::broadcast`
//! usage pattern in `telemetry`, generalised here to per-subscriber bounded
//! `mpsc` channels so each subscriber's drop count is independently visible.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One entry in the event stream. Request/response bodies are not embedded;
/// subscribers that want body content correlate `request_id` against the
/// engine's own traffic record.
#[derive(Clone, Debug)]
pub enum Event {
	RequestInitiated { request_id: Uuid, method: String, url: String },
	RequestBodyPart { request_id: Uuid, len: usize },
	Request { request_id: Uuid },
	ResponseInitiated { request_id: Uuid, status: u16 },
	ResponseBodyPart { request_id: Uuid, len: usize },
	Response { request_id: Uuid, status: u16, tags: Vec<String> },
	Abort { request_id: Uuid, reason: String },
	WebsocketRequest { request_id: Uuid },
	WebsocketAccepted { request_id: Uuid },
	WebsocketMessageReceived { request_id: Uuid, len: usize },
	WebsocketMessageSent { request_id: Uuid, len: usize },
	WebsocketClose { request_id: Uuid, code: u16 },
	TlsPassthroughOpened { sni: Option<String> },
	TlsPassthroughClosed { sni: Option<String> },
	TlsClientError { cause: String, sni: Option<String> },
	ClientError { message: String },
	RuleEvent { rule_id: Uuid, name: String },
	/// Meta-event emitted in place of whatever a subscriber missed once its
	/// queue overflowed.
	SubscriberDropped { dropped_count: u64 },
}

impl Event {
	pub fn name(&self) -> &'static str {
		match self {
			Event::RequestInitiated { .. } => "request-initiated",
			Event::RequestBodyPart { .. } => "request-body-part",
			Event::Request { .. } => "request",
			Event::ResponseInitiated { .. } => "response-initiated",
			Event::ResponseBodyPart { .. } => "response-body-part",
			Event::Response { .. } => "response",
			Event::Abort { .. } => "abort",
			Event::WebsocketRequest { .. } => "websocket-request",
			Event::WebsocketAccepted { .. } => "websocket-accepted",
			Event::WebsocketMessageReceived { .. } => "websocket-message-received",
			Event::WebsocketMessageSent { .. } => "websocket-message-sent",
			Event::WebsocketClose { .. } => "websocket-close",
			Event::TlsPassthroughOpened { .. } => "tls-passthrough-opened",
			Event::TlsPassthroughClosed { .. } => "tls-passthrough-closed",
			Event::TlsClientError { .. } => "tls-client-error",
			Event::ClientError { .. } => "client-error",
			Event::RuleEvent { .. } => "rule-event",
			Event::SubscriberDropped { .. } => "subscriber-dropped",
		}
	}
}

#[derive(Clone, Debug)]
pub struct TimestampedEvent {
	pub at: SystemTime,
	pub event: Event,
}

struct Subscriber {
	id: u64,
	tx: mpsc::Sender<TimestampedEvent>,
	dropped: Arc<AtomicU64>,
}

/// The engine's event bus (§4.7, §5 "lock-free publish with per-subscriber
/// bounded queues").
pub struct EventBus {
	subscribers: RwLock<Vec<Subscriber>>,
	next_id: AtomicU64,
	capacity: usize,
}

impl EventBus {
	pub fn new(capacity: usize) -> Arc<Self> {
		Arc::new(EventBus {
			subscribers: RwLock::new(Vec::new()),
			next_id: AtomicU64::new(0),
			capacity,
		})
	}

	/// Registers a new subscriber with its own bounded queue. The returned
	/// receiver yields every event published after this call.
	pub fn subscribe(self: &Arc<Self>) -> (u64, mpsc::Receiver<TimestampedEvent>) {
		let (tx, rx) = mpsc::channel(self.capacity);
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.subscribers.write().push(Subscriber {
			id,
			tx,
			dropped: Arc::new(AtomicU64::new(0)),
		});
		(id, rx)
	}

	pub fn unsubscribe(&self, id: u64) {
		self.subscribers.write().retain(|s| s.id != id);
	}

	/// Fire-and-forget publish: never awaits, never blocks request handling.
	/// A full queue increments that subscriber's drop counter and the next
	/// successfully delivered event is preceded by a `subscriber-dropped`
	/// meta-event carrying the cumulative count.
	pub fn publish(&self, event: Event) {
		let now = SystemTime::now();
		let subs = self.subscribers.read();
		for sub in subs.iter() {
			let dropped_before = sub.dropped.load(Ordering::Relaxed);
			if dropped_before > 0
				&& sub
					.tx
					.try_send(TimestampedEvent {
						at: now,
						event: Event::SubscriberDropped {
							dropped_count: dropped_before,
						},
					})
					.is_ok()
			{
				sub.dropped.store(0, Ordering::Relaxed);
			}
			let item = TimestampedEvent {
				at: now,
				event: event.clone(),
			};
			if sub.tx.try_send(item).is_err() {
				sub.dropped.fetch_add(1, Ordering::Relaxed);
			}
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.read().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn publish_delivers_to_subscriber() {
		let bus = EventBus::new(4);
		let (_id, mut rx) = bus.subscribe();
		bus.publish(Event::ClientError {
			message: "eof".to_string(),
		});
		let got = rx.recv().await.unwrap();
		assert_eq!(got.event.name(), "client-error");
	}

	#[tokio::test]
	async fn overflow_emits_subscriber_dropped_meta_event() {
		let bus = EventBus::new(1);
		let (_id, mut rx) = bus.subscribe();
		// Fill the one slot, then overflow twice without draining.
		for _ in 0..3 {
			bus.publish(Event::ClientError {
				message: "x".to_string(),
			});
		}
		// Drain the one buffered event, then publish again: a
		// subscriber-dropped meta-event must appear before further events.
		let _first = rx.recv().await.unwrap();
		bus.publish(Event::ClientError {
			message: "y".to_string(),
		});
		let next = rx.recv().await.unwrap();
		assert_eq!(next.event.name(), "subscriber-dropped");
	}

	#[tokio::test]
	async fn unsubscribe_stops_delivery() {
		let bus = EventBus::new(4);
		let (id, mut rx) = bus.subscribe();
		bus.unsubscribe(id);
		bus.publish(Event::ClientError {
			message: "x".to_string(),
		});
		assert!(rx.try_recv().is_err());
	}
}
