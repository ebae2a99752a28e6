//! In-process broker with pull subscriptions, leases and redelivery.
//!
//! [`InMemoryBroker`] reproduces the delivery semantics the RPC layer has to
//! cope with in production:
//!
//! - Every subscription on a topic receives its own copy of each matching
//!   message. Publishing to a topic without subscriptions drops the message.
//! - A pulled message is leased for the subscription's ack deadline. If it is
//!   not acknowledged in time, or its deadline is reset to zero (a nack), it
//!   becomes deliverable again with a new ack id.
//! - Each pulled batch can be handed out in publish order, reversed, or
//!   shuffled ([`DeliveryOrder`]), to exercise out-of-order handling.
//!
//! Failures can be injected with [`InMemoryBroker::inject_failures`] to
//! exercise retry and error paths.

use super::{Broker, Filter, MAX_ACK_DEADLINE, SubscriptionConfig};
use crate::common::{Error, Message, ReceivedMessage, Result};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

/// Order in which a pulled batch is handed to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryOrder {
    /// Publish order.
    #[default]
    Fifo,
    /// Each batch reversed.
    Reversed,
    /// Each batch randomly permuted.
    Shuffled,
}

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    message: Message,
    delivery_attempt: u32,
}

#[derive(Debug)]
struct Lease {
    stored: Stored,
    deadline: Instant,
}

#[derive(Debug)]
struct SubscriptionState {
    topic: String,
    filter: Filter,
    config: SubscriptionConfig,
    backlog: VecDeque<Stored>,
    leased: HashMap<String, Lease>,
}

impl SubscriptionState {
    /// Returns expired leases to the backlog.
    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in expired {
            self.release(&ack_id);
        }
    }

    fn release(&mut self, ack_id: &str) -> bool {
        match self.leased.remove(ack_id) {
            Some(lease) => {
                let mut stored = lease.stored;
                stored.delivery_attempt += 1;
                self.backlog.push_back(stored);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    subscriptions: Mutex<HashMap<String, SubscriptionState>>,
    delivery_order: DeliveryOrder,
    next_message_id: AtomicU64,
    next_ack_id: AtomicU64,
    pending_failures: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delivery_order(delivery_order: DeliveryOrder) -> Self {
        Self {
            delivery_order,
            ..Self::default()
        }
    }

    /// Makes the next `count` broker calls fail with a transient error.
    pub fn inject_failures(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of messages waiting to be pulled, or `None` if the subscription
    /// does not exist.
    pub fn backlog_len(&self, subscription: &str) -> Option<usize> {
        self.subscriptions
            .lock()
            .get(subscription)
            .map(|sub| sub.backlog.len())
    }

    /// Number of pulled but unacknowledged messages.
    pub fn leased_len(&self, subscription: &str) -> Option<usize> {
        self.subscriptions
            .lock()
            .get(subscription)
            .map(|sub| sub.leased.len())
    }

    pub fn subscription_config(&self, subscription: &str) -> Option<SubscriptionConfig> {
        self.subscriptions
            .lock()
            .get(subscription)
            .map(|sub| sub.config.clone())
    }

    fn check_ack_deadline(ack_deadline: Duration) -> Result<()> {
        if ack_deadline > MAX_ACK_DEADLINE {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "ack deadline {ack_deadline:?} exceeds the maximum of {MAX_ACK_DEADLINE:?}"
                ),
            });
        }
        Ok(())
    }

    fn take_failure(&self, operation: &'static str) -> Result<()> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(Error::broker(operation, "injected failure"))
        } else {
            Ok(())
        }
    }

    fn do_publish(&self, topic: &str, messages: Vec<Message>) -> Result<Vec<String>> {
        self.take_failure("publish")?;
        let mut subscriptions = self.subscriptions.lock();
        let mut ids = Vec::with_capacity(messages.len());

        for message in messages {
            let message_id = self
                .next_message_id
                .fetch_add(1, Ordering::Relaxed)
                .to_string();
            for sub in subscriptions.values_mut() {
                if sub.topic == topic && sub.filter.matches(&message.attributes) {
                    sub.backlog.push_back(Stored {
                        message_id: message_id.clone(),
                        message: message.clone(),
                        delivery_attempt: 1,
                    });
                }
            }
            ids.push(message_id);
        }

        Ok(ids)
    }

    fn do_pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        self.take_failure("pull")?;
        let now = Instant::now();
        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound {
                subscription: subscription.to_string(),
            })?;

        sub.expire_leases(now);

        let count = max_messages.min(sub.backlog.len());
        let mut pulled = Vec::with_capacity(count);
        for stored in sub.backlog.drain(..count) {
            let ack_id = format!(
                "{}-{}",
                stored.message_id,
                self.next_ack_id.fetch_add(1, Ordering::Relaxed)
            );
            pulled.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message_id: stored.message_id.clone(),
                delivery_attempt: stored.delivery_attempt,
                message: stored.message.clone(),
            });
            sub.leased.insert(
                ack_id,
                Lease {
                    stored,
                    deadline: now + sub.config.ack_deadline,
                },
            );
        }

        match self.delivery_order {
            DeliveryOrder::Fifo => {}
            DeliveryOrder::Reversed => pulled.reverse(),
            DeliveryOrder::Shuffled => pulled.shuffle(&mut rand::rng()),
        }

        Ok(pulled)
    }

    fn do_acknowledge(&self, subscription: &str, ack_ids: Vec<String>) -> Result<()> {
        self.take_failure("acknowledge")?;
        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound {
                subscription: subscription.to_string(),
            })?;

        let mut unknown = 0;
        for ack_id in &ack_ids {
            if sub.leased.remove(ack_id).is_none() {
                unknown += 1;
            }
        }

        if unknown > 0 && sub.config.exactly_once {
            return Err(Error::AckRejected {
                subscription: subscription.to_string(),
                count: unknown,
            });
        }
        Ok(())
    }

    fn do_modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline: Duration,
    ) -> Result<()> {
        self.take_failure("modify_ack_deadline")?;
        Self::check_ack_deadline(ack_deadline)?;
        let mut subscriptions = self.subscriptions.lock();
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound {
                subscription: subscription.to_string(),
            })?;

        for ack_id in &ack_ids {
            if ack_deadline.is_zero() {
                sub.release(ack_id);
            } else if let Some(lease) = sub.leased.get_mut(ack_id) {
                lease.deadline = Instant::now() + ack_deadline;
            }
        }
        Ok(())
    }

    fn do_create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        config: SubscriptionConfig,
    ) -> Result<()> {
        self.take_failure("create_subscription")?;
        Self::check_ack_deadline(config.ack_deadline)?;
        let filter = match &config.filter {
            Some(expr) => Filter::parse(expr)?,
            None => Filter::default(),
        };

        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(subscription) {
            return Err(Error::SubscriptionExists {
                subscription: subscription.to_string(),
            });
        }

        subscriptions.insert(
            subscription.to_string(),
            SubscriptionState {
                topic: topic.to_string(),
                filter,
                config,
                backlog: VecDeque::new(),
                leased: HashMap::new(),
            },
        );
        Ok(())
    }

    fn do_delete_subscription(&self, subscription: &str) -> Result<()> {
        self.take_failure("delete_subscription")?;
        self.subscriptions
            .lock()
            .remove(subscription)
            .map(|_| ())
            .ok_or_else(|| Error::SubscriptionNotFound {
                subscription: subscription.to_string(),
            })
    }
}

impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<Vec<String>> {
        self.do_publish(topic, messages)
    }

    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        self.do_pull(subscription, max_messages)
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<String>) -> Result<()> {
        self.do_acknowledge(subscription, ack_ids)
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline: Duration,
    ) -> Result<()> {
        self.do_modify_ack_deadline(subscription, ack_ids, ack_deadline)
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        config: SubscriptionConfig,
    ) -> Result<()> {
        self.do_create_subscription(subscription, topic, config)
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        self.do_delete_subscription(subscription)
    }

    // Nothing to release: the broker lives as long as its last handle.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
