//! Connection acceptor (§4.2): TLS-vs-plaintext detection, the rule-engine
//! dispatch loop, CONNECT tunnelling, and WebSocket upgrades. Grounded on the
//! teacher's `proxy/gateway.rs` accept-loop/auto-server pattern.

pub mod acceptor;

pub use acceptor::Acceptor;
