//! Background tasks shared by every RPC endpoint.
//!
//! ## Submodules
//!
//! - [`batch`] - Size/time batching queue worker used for acks, nacks and
//!   outbound publishes, with drain-on-shutdown.
//! - [`consumer`] - Pull loop that bounds in-flight handlers and routes their
//!   outcomes to the ack and nack queues.

pub mod batch;
pub mod consumer;

pub use batch::batch_worker;
pub use consumer::{ConsumerSettings, MessageHandler, consume_loop};
