//! Shared types for the RPC layer: errors, messages, wire attribute keys and
//! endpoint identities.

pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{Message, ReceivedMessage};
pub use types::*;
