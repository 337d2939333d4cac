//! Multi-client TCP chat relay.
//!
//! Clients connect, claim a unique display name, and then exchange public
//! broadcasts, `/w` whispers, and `/dm` direct messages through a central
//! server. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface (listen address only).
//! - [`protocol`] provides the newline-framed text protocol: constants,
//!   server-line formatting, and async read/write helpers.
//! - [`registry`] owns the shared table of live sessions and the delivery
//!   primitives (`send_to`, `broadcast`, presence updates).
//! - [`router`] classifies inbound text as broadcast, whisper, or direct
//!   message and dispatches through the registry.
//! - [`session`] drives one connection through its lifecycle: registration
//!   handshake, message loop, and teardown.
//! - [`server`] accepts TCP connections and spawns one session task each.
//!
//! Integration tests use this crate directly and speak the wire protocol
//! over raw `TcpStream`s.

pub mod cli;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
