//! Shared foundation for the cortex runtime: configuration, error types,
//! and the normalized chat/event data model every other crate builds on.

pub mod config;
pub mod error;
pub mod types;

pub use error::{CortexError, Result};
