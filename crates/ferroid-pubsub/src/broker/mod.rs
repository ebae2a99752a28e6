//! The publish/subscribe transport consumed by RPC endpoints.
//!
//! Endpoints never talk to a concrete broker. They are generic over
//! [`Broker`], which exposes the handful of primitives the protocol needs:
//! publishing to a topic, pulling from a subscription, acknowledging or
//! resetting the ack deadline of pulled messages, and managing
//! subscriptions.
//!
//! The transport is assumed to be at-least-once and unordered. Anything the
//! RPC layer builds on top (correlation, ordering, batching) lives elsewhere.
//!
//! ## Submodules
//!
//! - [`filter`] - Attribute filter expressions for subscriptions.
//! - [`memory`] - In-process broker with ack deadlines and redelivery.
//! - [`retry`] - Decorator retrying transient broker failures.

pub mod filter;
pub mod memory;
pub mod retry;

use crate::common::{Message, ReceivedMessage, Result};
use core::time::Duration;

pub use filter::Filter;
pub use memory::{DeliveryOrder, InMemoryBroker};
pub use retry::{RetryPolicy, RetryingBroker};

/// Default time a pulled message stays invisible before redelivery.
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Longest lease a broker grants on a pulled message.
pub const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);

/// Options applied when creating a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Attribute filter; only matching messages are delivered.
    pub filter: Option<String>,
    /// Ask the broker not to redeliver acknowledged messages. Brokers that
    /// cannot honor this ignore it.
    pub exactly_once: bool,
    /// How long a pulled message stays leased to the puller. At most
    /// [`MAX_ACK_DEADLINE`].
    pub ack_deadline: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            filter: None,
            exactly_once: false,
            ack_deadline: DEFAULT_ACK_DEADLINE,
        }
    }
}

/// Publish/subscribe primitives required by the RPC layer.
pub trait Broker: Send + Sync + 'static {
    /// Publishes `messages` to `topic`, returning their broker-assigned ids.
    fn publish(
        &self,
        topic: &str,
        messages: Vec<Message>,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Pulls up to `max_messages` deliverable messages. May return fewer, or
    /// none, without waiting.
    fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> impl Future<Output = Result<Vec<ReceivedMessage>>> + Send;

    /// Marks the given deliveries as processed.
    fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Extends or shortens the lease on the given deliveries. A zero deadline
    /// makes them immediately redeliverable.
    fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        config: SubscriptionConfig,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_subscription(&self, subscription: &str) -> impl Future<Output = Result<()>> + Send;

    /// Releases any connections held by this handle.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<B: Broker> Broker for std::sync::Arc<B> {
    fn publish(
        &self,
        topic: &str,
        messages: Vec<Message>,
    ) -> impl Future<Output = Result<Vec<String>>> + Send {
        (**self).publish(topic, messages)
    }

    fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> impl Future<Output = Result<Vec<ReceivedMessage>>> + Send {
        (**self).pull(subscription, max_messages)
    }

    fn acknowledge(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).acknowledge(subscription, ack_ids)
    }

    fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline: Duration,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).modify_ack_deadline(subscription, ack_ids, ack_deadline)
    }

    fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        config: SubscriptionConfig,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).create_subscription(subscription, topic, config)
    }

    fn delete_subscription(&self, subscription: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).delete_subscription(subscription)
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).close()
    }
}
