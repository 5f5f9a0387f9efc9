//! Transport layer: the `Socket`/`SocketType` abstraction used by both the
//! inbound acceptor and the outbound passthrough dialer, and TLS
//! configuration shared between them.
//!
//! Grounded on the teacher's `transport/stream.rs` and `transport/tls.rs`,
//! trimmed of the mTLS/SPIFFE identity verification machinery (HBONE,
//! trust-domain, identity verifiers) that has no counterpart in this spec —
//! this proxy terminates TLS with a locally-minted CA, it doesn't verify
//! peer identities against a mesh trust domain.

pub mod sni;
pub mod stream;
pub mod tls;

pub use stream::{Extension, Socket, SocketType};
