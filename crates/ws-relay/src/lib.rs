//! Verified bidirectional WebSocket relay.
//!
//! This crate accepts inbound WebSocket connections, authenticates each one
//! against a remote verification endpoint before the handshake completes,
//! and then relays frames verbatim to an upstream browser-automation backend
//! speaking the Chrome DevTools Protocol.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  ws-relay  <--WS-->  CDP backend
//!                     |
//!              [ConnectionGate]
//!                     |
//!              [SessionVerifier]  --HTTP-->  verification API
//! ```
//!
//! Frames the client sends while the upstream dial is still in flight are
//! buffered (up to a fixed capacity) and flushed in arrival order once the
//! upstream opens. Closing either side closes the other.

pub mod gate;
pub mod listener;
pub mod relay;
pub mod upstream;
pub mod verifier;

// Re-export the primary public types at the crate root for convenience.
pub use gate::{ConnectionGate, GateRejection};
pub use listener::{Proxy, ProxyConfig};
pub use relay::{CloseCause, RelaySession, SessionConfig};
pub use upstream::{ResolverConfig, UpstreamMode, UpstreamResolver, UpstreamTarget};
pub use verifier::{
    Credentials, HttpSessionVerifier, SessionVerifier, VerificationResult, VerifierConfig,
};
