//! Configuration module
//!
//! Handles loading server settings.

mod settings;

pub use settings::*;
