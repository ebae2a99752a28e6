//! Client and server endpoints.
//!
//! Both roles are built on [`Endpoint`], which owns the identity, the inbound
//! subscription, the topics and the background tasks. Each role contributes a
//! [`MessageHandler`](crate::worker::MessageHandler) for its inbound messages:
//!
//! - The client routes responses to the job that is waiting for them, either
//!   a single result or an [`OrderedStream`](crate::stream::OrderedStream).
//! - The server hands requests to a user [`Processor`] and queues the
//!   responses for batched publishing.
//!
//! ## Lifecycle
//!
//! ```text
//! new -> initialize -> startup -> ... -> shutdown -> cleanup
//! ```
//!
//! ## Submodules
//!
//! - [`endpoint`] - Shared state, background tasks and two-phase shutdown.
//! - [`client`] - Job submission and response correlation.
//! - [`server`] - Request dispatch and ordered stream emission.

pub mod client;
pub mod endpoint;
pub mod server;

pub use client::RpcClient;
pub use endpoint::{Endpoint, subscription_path, topic_path};
pub use server::{Processor, RpcServer};
