//! In-process realtime transport
//!
//! The socket layer the connection context sits on: server options, namespaces
//! with their room adapter, one client per accepted WebSocket, and one socket
//! per client and namespace.

mod adapter;
mod client;
mod namespace;
mod outbox;
mod socket;

pub use adapter::*;
pub use client::*;
pub use namespace::*;
pub use outbox::*;
pub use socket::*;
