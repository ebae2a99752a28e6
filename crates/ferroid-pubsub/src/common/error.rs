//! Error types for the pub/sub RPC layer.
//!
//! This module defines the central `Error` enum, which captures every failure
//! surfaced by the endpoints, the background workers and the broker
//! implementations.
//!
//! ## Error Cases
//! - `ProtocolViolation`: A message broke the wire protocol (sender mismatch,
//!   unknown `response-type`, missing or malformed `message_order`).
//! - `Broker`: A transient transport failure. Background tasks log these and
//!   keep going; the broker's redelivery is the real backstop.
//! - `AckRejected`: Exactly-once acks for leases that already lapsed.
//! - `StreamStalled` / `StreamClosed`: An ordered stream could not make
//!   progress.
//! - `Timeout` / `JobDropped`: A single-result call did not complete.
//! - `Handler` / `NotImplemented`: User-supplied processing failed.
//! - `ServiceShutdown`: A request arrived while the endpoint was stopping.

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the pub/sub RPC layer.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A message violated the request/response wire protocol.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// A broker call failed. Usually transient.
    #[error("Broker error during {operation}: {context}")]
    Broker {
        operation: &'static str,
        context: String,
    },

    /// The subscription already exists on the broker.
    #[error("Subscription already exists: {subscription}")]
    SubscriptionExists { subscription: String },

    /// The broker refused acks for expired or unknown ack ids. Permanent:
    /// the deliveries behind them are already up for redelivery.
    #[error("Acknowledge rejected on {subscription}: {count} ack ids were expired or unknown")]
    AckRejected { subscription: String, count: usize },

    /// The subscription does not exist on the broker.
    #[error("Subscription not found: {subscription}")]
    SubscriptionNotFound { subscription: String },

    /// No stream item arrived within the per-item timeout.
    #[error("Stream stalled: no item received within {timeout:?}")]
    StreamStalled { timeout: Duration },

    /// Every stream writer went away before the end-of-stream marker.
    #[error("Stream closed before end of stream")]
    StreamClosed,

    /// A single-result call did not resolve in time.
    #[error("Job {job_id} timed out after {timeout:?}")]
    Timeout { job_id: String, timeout: Duration },

    /// The pending result slot was evicted before a response arrived.
    #[error("Job {job_id} was dropped before a response arrived")]
    JobDropped { job_id: String },

    /// A user-supplied handler failed.
    #[error("Handler error: {reason}")]
    Handler { reason: String },

    /// A user-supplied handler was not provided for this kind of request.
    #[error("Not implemented: {operation}")]
    NotImplemented { operation: &'static str },

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The endpoint configuration is unusable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// `startup` was called on an endpoint that is already running.
    #[error("Endpoint already started")]
    AlreadyStarted,

    /// The endpoint is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    pub fn broker(operation: &'static str, context: impl Into<String>) -> Self {
        Self::Broker {
            operation,
            context: context.into(),
        }
    }

    pub fn handler(reason: impl core::fmt::Display) -> Self {
        Self::Handler {
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same broker call may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Broker { .. })
    }
}
