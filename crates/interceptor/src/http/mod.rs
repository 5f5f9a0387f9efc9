//! HTTP parsing and in-memory request/response representation (§3, §9
//! "Raw header order"). `body`/`buflist` are the shared body-peeking
//! plumbing the codec and rule-engine body matchers both build on.

pub mod body;
mod buflist;
pub mod message;

pub use body::{Body, Error, inspect_body, read_body_with_limit};
pub use message::{Destination, Protocol, RawHeaders, RequestRecord, ResponseRecord, TimingEvents};
