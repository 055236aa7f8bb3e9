//! Realtime socket server with a request-style connection context.
//!
//! Each accepted WebSocket connection gets a [`ConnectionContext`] that
//! forwards to its socket and derives request properties (path, query,
//! host, protocol, client addresses) from the upgrade request.

pub mod config;
pub mod context;
pub mod server;
pub mod transport;

pub use context::{context, ConnectionContext, Cookies, Query};
pub use server::{Packet, Router, ServerConfig, WebSocketServer};
pub use transport::{Client, Namespace, Socket};
