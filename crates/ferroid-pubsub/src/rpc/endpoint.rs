use crate::{
    broker::{Broker, SubscriptionConfig},
    common::{Error, HostId, Message, Result},
    config::RpcConfig,
    worker::{ConsumerSettings, MessageHandler, batch_worker, consume_loop},
};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Fully qualified topic name: `projects/{project}/topics/{name}`.
pub fn topic_path(project_id: &str, name: &str) -> String {
    format!("projects/{project_id}/topics/{name}")
}

/// Fully qualified subscription name:
/// `projects/{project}/subscriptions/{name}`.
pub fn subscription_path(project_id: &str, name: &str) -> String {
    format!("projects/{project_id}/subscriptions/{name}")
}

#[derive(Debug, Default)]
struct Tasks {
    started: bool,
    consumer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// State and lifecycle shared by clients and servers.
///
/// An endpoint owns its host identity, its inbound subscription and the
/// inbound/outbound topics, plus the background tasks that keep the
/// subscription flowing: the consumer loop, the acker and the nacker. Roles
/// can attach extra workers (the server's publisher, the client's cache
/// sweeper) with [`Endpoint::spawn_worker`]; they are stopped together with
/// the acker and nacker.
///
/// Shutdown happens in two phases, each with its own cancellation token: the
/// consumer first, so the outcomes of in-flight handlers still reach the
/// queues, then the workers, which drain those queues one last time.
#[derive(Debug)]
pub struct Endpoint<B> {
    broker: Arc<B>,
    config: RpcConfig,
    host_id: HostId,
    subscription: String,
    inbound_topic: String,
    outbound_topic: String,
    consumer_token: CancellationToken,
    worker_token: CancellationToken,
    tasks: Mutex<Tasks>,
}

impl<B: Broker> Endpoint<B> {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        broker: Arc<B>,
        config: RpcConfig,
        host_id: HostId,
        subscription: String,
        inbound_topic: String,
        outbound_topic: String,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            broker,
            config,
            host_id,
            subscription,
            inbound_topic,
            outbound_topic,
            consumer_token: CancellationToken::new(),
            worker_token: CancellationToken::new(),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    pub const fn host_id(&self) -> &HostId {
        &self.host_id
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn inbound_topic(&self) -> &str {
        &self.inbound_topic
    }

    pub fn outbound_topic(&self) -> &str {
        &self.outbound_topic
    }

    pub const fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub const fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Whether [`Endpoint::shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.consumer_token.is_cancelled()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().started && !self.is_shutting_down()
    }

    /// Creates the inbound subscription on the inbound topic.
    pub(crate) async fn create_subscription(&self, config: SubscriptionConfig) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::info!(
            subscription = %self.subscription,
            topic = %self.inbound_topic,
            filter = ?config.filter,
            exactly_once = config.exactly_once,
            "Creating inbound subscription"
        );
        self.broker
            .create_subscription(&self.subscription, &self.inbound_topic, config)
            .await
    }

    /// Publishes directly to the outbound topic, bypassing any queue.
    pub(crate) async fn publish(&self, messages: Vec<Message>) -> Result<Vec<String>> {
        self.broker.publish(&self.outbound_topic, messages).await
    }

    /// Spawns the consumer loop feeding `handler`, plus the acker and nacker.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the endpoint was started before.
    /// - [`Error::ServiceShutdown`] if the endpoint has been shut down.
    pub(crate) fn start<H: MessageHandler>(&self, handler: Arc<H>) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        let mut tasks = self.tasks.lock();
        if tasks.started {
            return Err(Error::AlreadyStarted);
        }
        tasks.started = true;

        let (ack_tx, ack_rx) = mpsc::unbounded_channel::<String>();
        let (nack_tx, nack_rx) = mpsc::unbounded_channel::<String>();

        let broker = Arc::clone(&self.broker);
        let subscription = self.subscription.clone();
        tasks.workers.push(tokio::spawn(batch_worker(
            "acker",
            ack_rx,
            self.config.ack_max_wait,
            self.config.ack_batch_size,
            self.worker_token.clone(),
            move |ack_ids| {
                let broker = Arc::clone(&broker);
                let subscription = subscription.clone();
                async move { broker.acknowledge(&subscription, ack_ids).await }
            },
        )));

        let broker = Arc::clone(&self.broker);
        let subscription = self.subscription.clone();
        tasks.workers.push(tokio::spawn(batch_worker(
            "nacker",
            nack_rx,
            self.config.nack_max_wait,
            self.config.nack_batch_size,
            self.worker_token.clone(),
            move |ack_ids| {
                let broker = Arc::clone(&broker);
                let subscription = subscription.clone();
                async move {
                    broker
                        .modify_ack_deadline(&subscription, ack_ids, Duration::ZERO)
                        .await
                }
            },
        )));

        let settings = ConsumerSettings {
            subscription: self.subscription.clone(),
            concurrency_limit: self.config.concurrency_limit,
            poll_interval: self.config.poll_interval,
            min_poll_interval: self.config.min_poll_interval,
            shutdown_timeout: self.config.shutdown_timeout,
        };
        tasks.consumer = Some(tokio::spawn(consume_loop(
            Arc::clone(&self.broker),
            handler,
            settings,
            ack_tx,
            nack_tx,
            self.consumer_token.clone(),
        )));

        #[cfg(feature = "tracing")]
        tracing::info!(
            host_id = %self.host_id,
            subscription = %self.subscription,
            "Endpoint started"
        );
        Ok(())
    }

    /// Spawns a role-specific background task. The task receives the worker
    /// token and must return once it is cancelled.
    pub(crate) fn spawn_worker<F, Fut>(&self, worker: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(worker(self.worker_token.clone()));
        self.tasks.lock().workers.push(handle);
    }

    /// Stops the background tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (consumer, workers) = {
            let mut tasks = self.tasks.lock();
            (tasks.consumer.take(), core::mem::take(&mut tasks.workers))
        };

        // === Phase 1: Stop pulling, let in-flight handlers finish ===
        #[cfg(feature = "tracing")]
        tracing::info!(subscription = %self.subscription, "Stopping consumer");
        self.consumer_token.cancel();
        if let Some(consumer) = consumer {
            if let Err(_e) = consumer.await {
                #[cfg(feature = "tracing")]
                tracing::error!("Consumer task failed: {_e}");
            }
        }

        // === Phase 2: Drain acks, nacks and outbound messages ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Cancelling {} background workers", workers.len());
        self.worker_token.cancel();
        for joined in futures::future::join_all(workers).await {
            if let Err(_e) = joined {
                #[cfg(feature = "tracing")]
                tracing::error!("Background worker failed: {_e}");
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(subscription = %self.subscription, "Endpoint shutdown complete");
    }

    /// Deletes the inbound subscription and closes the broker handle.
    ///
    /// Intended to run after [`Endpoint::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns the first broker error. The broker handle is closed even if
    /// deleting the subscription failed.
    pub async fn cleanup(&self) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::info!(subscription = %self.subscription, "Deleting inbound subscription");
        let deleted = self.broker.delete_subscription(&self.subscription).await;
        let closed = self.broker.close().await;
        deleted.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::InMemoryBroker,
        common::{Message, ReceivedMessage},
    };
    use core::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "projects/p/topics/in";
    const SUB: &str = "projects/p/subscriptions/in";

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl MessageHandler for Counting {
        async fn on_message(&self, _message: &ReceivedMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn endpoint(broker: Arc<InMemoryBroker>) -> Endpoint<InMemoryBroker> {
        let config = RpcConfig {
            poll_interval: Duration::from_millis(5),
            min_poll_interval: Duration::from_millis(1),
            ack_max_wait: Duration::from_millis(5),
            nack_max_wait: Duration::from_millis(5),
            ..RpcConfig::default()
        };
        Endpoint::new(
            broker,
            config,
            HostId::generate(),
            SUB.to_string(),
            TOPIC.to_string(),
            "projects/p/topics/out".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn resource_paths() {
        assert_eq!(topic_path("p", "t"), "projects/p/topics/t");
        assert_eq!(subscription_path("p", "s"), "projects/p/subscriptions/s");
    }

    #[test]
    fn rejects_invalid_config() {
        let config = RpcConfig {
            concurrency_limit: 0,
            ..RpcConfig::default()
        };
        let result = Endpoint::new(
            Arc::new(InMemoryBroker::new()),
            config,
            HostId::generate(),
            SUB.to_string(),
            TOPIC.to_string(),
            TOPIC.to_string(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn lifecycle_acks_and_drains() {
        let broker = Arc::new(InMemoryBroker::new());
        let endpoint = endpoint(Arc::clone(&broker));
        endpoint
            .create_subscription(SubscriptionConfig::default())
            .await
            .unwrap();

        let handler = Arc::new(Counting::default());
        endpoint.start(Arc::clone(&handler)).unwrap();
        assert!(endpoint.is_running());
        assert!(matches!(
            endpoint.start(Arc::clone(&handler)),
            Err(Error::AlreadyStarted)
        ));

        broker
            .publish(TOPIC, vec![Message::new("a"), Message::new("b")])
            .await
            .unwrap();
        while handler.calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        endpoint.shutdown().await;
        endpoint.shutdown().await;
        assert!(!endpoint.is_running());
        assert_eq!(broker.leased_len(SUB), Some(0));
        assert_eq!(broker.backlog_len(SUB), Some(0));
        assert!(matches!(
            endpoint.start(handler),
            Err(Error::ServiceShutdown)
        ));

        endpoint.cleanup().await.unwrap();
        assert_eq!(broker.backlog_len(SUB), None);
    }

    #[tokio::test]
    async fn extra_workers_stop_on_shutdown() {
        let endpoint = endpoint(Arc::new(InMemoryBroker::new()));
        let stopped = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&stopped);
        endpoint.spawn_worker(|token| async move {
            token.cancelled().await;
            flag.fetch_add(1, Ordering::SeqCst);
        });
        endpoint.shutdown().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
