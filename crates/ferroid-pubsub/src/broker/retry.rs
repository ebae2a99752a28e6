use super::{Broker, SubscriptionConfig};
use crate::common::{Message, ReceivedMessage, Result};
use core::time::Duration;
use rand::Rng;

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below one behave as one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep after the `attempt`-th failure (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        rand::rng().random_range(Duration::ZERO..=ceiling)
    }
}

/// Wraps a [`Broker`] and retries calls that fail with a transient error.
///
/// Only errors for which [`Error::is_transient`] holds are retried; protocol
/// and subscription lifecycle errors are returned immediately.
///
/// [`Error::is_transient`]: crate::Error::is_transient
#[derive(Debug)]
pub struct RetryingBroker<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: Broker> RetryingBroker<B> {
    pub fn new(inner: B) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    pub fn with_policy(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, _operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.policy.jittered_backoff(attempt);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        operation = _operation,
                        attempt,
                        ?backoff,
                        "Transient broker failure, retrying: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    if attempt > 1 {
                        tracing::warn!(
                            operation = _operation,
                            attempt,
                            "Giving up on broker call: {e}"
                        );
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

impl<B: Broker> Broker for RetryingBroker<B> {
    async fn publish(&self, topic: &str, messages: Vec<Message>) -> Result<Vec<String>> {
        self.retry("publish", || self.inner.publish(topic, messages.clone()))
            .await
    }

    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        self.retry("pull", || self.inner.pull(subscription, max_messages))
            .await
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<String>) -> Result<()> {
        self.retry("acknowledge", || {
            self.inner.acknowledge(subscription, ack_ids.clone())
        })
        .await
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline: Duration,
    ) -> Result<()> {
        self.retry("modify_ack_deadline", || {
            self.inner
                .modify_ack_deadline(subscription, ack_ids.clone(), ack_deadline)
        })
        .await
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        config: SubscriptionConfig,
    ) -> Result<()> {
        self.retry("create_subscription", || {
            self.inner
                .create_subscription(subscription, topic, config.clone())
        })
        .await
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        self.retry("delete_subscription", || {
            self.inner.delete_subscription(subscription)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
