//! WebSocket server module
//!
//! Handles WebSocket connections from realtime clients and routes their
//! events to the appropriate handlers.

mod handler;
mod protocol;
mod websocket;

pub use handler::*;
pub use protocol::*;
pub use websocket::*;
