//! Two-player rendezvous relay.
//!
//! Clients connect over TCP and are paired two by two. Each member of a pair
//! is told its role (`white` or `black`), after which every payload one side
//! sends is forwarded verbatim to the other until either side sends `end` or
//! drops its socket. A client that is still waiting for a partner gets `any`
//! back for whatever it sends.
//!
//! - [`protocol`] holds the wire literals, role assignment and the rule that
//!   decides what happens to each inbound payload.
//! - [`registry`] is the plain pairing table keyed by remote address.
//! - [`connection`] owns one socket: its reading side and a shareable handle
//!   for writing to it.
//! - [`matchmaker`] guards the registry and performs admission, pairing and
//!   eviction as single critical sections.
//! - [`relay`] binds the listener, runs the accept loop and drives each
//!   connection's receive loop.
//! - [`cli`] and [`client`] provide the `serve` and `client` commands.

pub mod cli;
pub mod client;
pub mod connection;
pub mod matchmaker;
pub mod protocol;
pub mod registry;
pub mod relay;
