//! A programmable HTTP/1.1, HTTP/2, and WebSocket interception engine: TLS
//! termination with per-host certificate minting, a tagged-variant rule
//! matcher/step pipeline, a passthrough/forward engine for whatever a rule
//! doesn't handle itself, and an event bus exposing the whole lifecycle.

pub mod ca;
pub mod codec;
pub mod config;
pub mod errors;
pub mod events;
pub mod http;
pub mod passthrough;
pub mod rules;
pub mod server;
pub mod session;
pub mod transport;
pub mod websocket;
