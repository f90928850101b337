//! Signaling relay: forwards handshake signals and fallback messages between
//! workers by id. Keeps nothing but the live id -> connection mapping.

pub mod client;
pub mod server;

pub use client::{LinkId, RelaySender, connect_relay};
pub use server::{RelayServer, Routing, RoutingTable};
