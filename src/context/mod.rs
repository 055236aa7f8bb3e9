//! Connection context
//!
//! The request-style facade handlers work with, its cookie jar and query
//! string parsing.

mod connection;
mod cookies;
mod query;

pub use connection::*;
pub use cookies::*;
pub use query::*;
