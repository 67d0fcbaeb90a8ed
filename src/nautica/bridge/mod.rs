//! Tunnel bridge: pairs one inbound WebSocket with one outbound connection and
//! relays opaque messages between them until either side goes away.
//!
//! The upgrade router (`crate::nautica::router`) decides whether a session is
//! started at all; everything after the handshake lives here.

pub mod channel;
pub mod session;
pub mod transport;
