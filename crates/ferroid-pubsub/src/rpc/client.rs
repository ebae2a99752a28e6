use super::endpoint::{Endpoint, subscription_path, topic_path};
use crate::{
    broker::{Broker, SubscriptionConfig},
    cache::TtlCache,
    common::{
        ATTR_EOS, ATTR_HOST_ID, ATTR_JOB_ID, ATTR_MESSAGE_ORDER, ATTR_RESPONSE_TYPE, ATTR_SENDER,
        EOS_MARKER, Error, HostId, Message, RESPONSE_TYPE_STREAM, ReceivedMessage, Result,
        new_job_id,
    },
    config::RpcConfig,
    stream::{OrderedStream, StreamWriter, ordered_stream},
    worker::MessageHandler,
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Pending jobs, keyed by job id.
#[derive(Debug)]
struct JobTable {
    singles: TtlCache<String, oneshot::Sender<Bytes>>,
    streams: TtlCache<String, StreamWriter<Bytes>>,
}

/// Routes responses arriving on the client's private subscription to the
/// jobs waiting for them.
#[derive(Debug)]
struct ResponseRouter {
    jobs: Mutex<JobTable>,
}

impl ResponseRouter {
    fn new(config: &RpcConfig) -> Self {
        Self {
            jobs: Mutex::new(JobTable {
                singles: TtlCache::new(config.job_cache_ttl, config.job_cache_capacity),
                streams: TtlCache::new(config.job_cache_ttl, config.job_cache_capacity),
            }),
        }
    }

    fn register_single(&self, job_id: &str) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        if self
            .jobs
            .lock()
            .singles
            .insert(job_id.to_string(), tx)
            .is_some()
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(job_id, "Replaced a pending job with the same id");
        }
        rx
    }

    fn register_stream(&self, job_id: &str, writer: StreamWriter<Bytes>) {
        if self
            .jobs
            .lock()
            .streams
            .insert(job_id.to_string(), writer)
            .is_some()
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(job_id, "Replaced a pending stream with the same id");
        }
    }

    fn forget(&self, job_id: &str) {
        let key = job_id.to_string();
        let mut jobs = self.jobs.lock();
        jobs.singles.remove(&key);
        jobs.streams.remove(&key);
    }

    fn purge_expired(&self) -> usize {
        let mut jobs = self.jobs.lock();
        jobs.singles.purge_expired() + jobs.streams.purge_expired()
    }

    fn pending(&self) -> usize {
        let jobs = self.jobs.lock();
        jobs.singles.len() + jobs.streams.len()
    }

    fn route(&self, job_id: &str, message: &ReceivedMessage) -> Result<()> {
        let key = job_id.to_string();
        let writer = {
            let mut jobs = self.jobs.lock();
            if let Some(tx) = jobs.singles.remove(&key) {
                #[cfg(feature = "tracing")]
                tracing::debug!(job_id, "Resolving single-result job");
                let _sent = tx.send(message.data().clone());
                #[cfg(feature = "tracing")]
                if _sent.is_err() {
                    tracing::debug!(job_id, "Caller stopped waiting for the result");
                }
                return Ok(());
            }
            jobs.streams.get(&key).cloned()
        };

        let Some(writer) = writer else {
            #[cfg(feature = "tracing")]
            tracing::debug!(job_id, "Dropping response for unknown or evicted job");
            return Ok(());
        };

        match route_chunk(&writer, message) {
            Ok(()) => {
                if writer.is_terminated() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(job_id, "Stream complete");
                    self.jobs.lock().streams.remove(&key);
                }
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(job_id, "Malformed stream response: {e}");
                writer.fail(e.clone());
                self.jobs.lock().streams.remove(&key);
                Err(e)
            }
        }
    }
}

/// Feeds one streamed response (or the end marker) to its ordered stream.
fn route_chunk(writer: &StreamWriter<Bytes>, message: &ReceivedMessage) -> Result<()> {
    let order = message
        .attribute(ATTR_MESSAGE_ORDER)
        .ok_or_else(|| Error::protocol("stream response without message_order"))?;
    let order: u64 = order
        .parse()
        .map_err(|_| Error::protocol(format!("invalid message_order {order:?}")))?;
    let sender = message
        .attribute(ATTR_SENDER)
        .ok_or_else(|| Error::protocol("stream response without sender"))?;

    if message.attribute(ATTR_EOS) == Some(EOS_MARKER) {
        writer.signal_end_of_stream(order, sender)
    } else {
        writer.add(message.data().clone(), order, sender)
    }
}

impl MessageHandler for ResponseRouter {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<()> {
        match message.attribute(ATTR_JOB_ID) {
            Some(job_id) => self.route(job_id, message),
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(message_id = %message.message_id, "Dropping response without job_id");
                Ok(())
            }
        }
    }
}

/// Submits jobs and correlates their responses.
///
/// Each client owns a private subscription on the response topic, filtered on
/// its host id, so it only ever sees responses to its own requests. Requests
/// carry `job_id` and `host_id`; servers copy both onto every response.
///
/// # Example
///
/// ```no_run
/// use ferroid_pubsub::{InMemoryBroker, RpcClient, RpcConfig};
/// use std::{sync::Arc, time::Duration};
///
/// # async fn run() -> ferroid_pubsub::Result<()> {
/// let broker = Arc::new(InMemoryBroker::new());
/// let client = RpcClient::new(broker, "demo", "responses", "requests", RpcConfig::default())?;
/// client.initialize(None).await?;
/// client.startup()?;
///
/// let reply = client.submit("ping", None, Duration::from_secs(5)).await?;
/// assert_eq!(reply.as_ref(), b"ping");
///
/// client.shutdown().await;
/// client.cleanup().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RpcClient<B> {
    endpoint: Endpoint<B>,
    router: Arc<ResponseRouter>,
}

impl<B: Broker> RpcClient<B> {
    /// Creates a client listening on `response_topic` and sending to
    /// `request_topic`, both relative to `project_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        broker: Arc<B>,
        project_id: &str,
        response_topic: &str,
        request_topic: &str,
        config: RpcConfig,
    ) -> Result<Self> {
        let host_id = HostId::generate();
        let subscription = subscription_path(project_id, &format!("sub_{host_id}"));
        let router = Arc::new(ResponseRouter::new(&config));
        let endpoint = Endpoint::new(
            broker,
            config,
            host_id,
            subscription,
            topic_path(project_id, response_topic),
            topic_path(project_id, request_topic),
        )?;
        Ok(Self { endpoint, router })
    }

    pub const fn endpoint(&self) -> &Endpoint<B> {
        &self.endpoint
    }

    pub const fn host_id(&self) -> &HostId {
        self.endpoint.host_id()
    }

    /// Number of jobs still waiting for a response, including expired ones
    /// not yet swept.
    pub fn pending_jobs(&self) -> usize {
        self.router.pending()
    }

    /// Creates the private response subscription.
    ///
    /// The subscription only receives messages whose `host_id` matches this
    /// client. A caller-supplied filter is kept and conjoined with that
    /// restriction.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the subscription cannot be created.
    pub async fn initialize(&self, config: Option<SubscriptionConfig>) -> Result<()> {
        let mut config = config.unwrap_or_default();
        let own = format!("attributes.{ATTR_HOST_ID} = \"{}\"", self.host_id());
        config.filter = Some(match config.filter.take() {
            Some(filter) => format!("({filter}) AND ({own})"),
            None => own,
        });
        self.endpoint.create_subscription(config).await
    }

    /// Starts the consumer, the ack/nack workers and the job cache sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call, or
    /// [`Error::ServiceShutdown`] after shutdown.
    pub fn startup(&self) -> Result<()> {
        self.endpoint.start(Arc::clone(&self.router))?;

        let router = Arc::clone(&self.router);
        let interval = self.endpoint.config().cache_sweep_interval;
        self.endpoint
            .spawn_worker(move |token| sweep_jobs(router, interval, token));
        Ok(())
    }

    /// Submits a job and waits up to `timeout` for its single response.
    ///
    /// A fresh job id is generated unless one is given.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no response arrives in time.
    /// - [`Error::JobDropped`] if the job was evicted from the cache, or
    ///   replaced by a job with the same id.
    /// - [`Error::ServiceShutdown`] if the client is shutting down.
    /// - The broker error if the request could not be published.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip_all, fields(job_id))
    )]
    pub async fn submit(
        &self,
        payload: impl Into<Bytes>,
        job_id: Option<String>,
        timeout: Duration,
    ) -> Result<Bytes> {
        if self.endpoint.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        let job_id = job_id.unwrap_or_else(new_job_id);
        #[cfg(feature = "tracing")]
        tracing::Span::current().record("job_id", job_id.as_str());

        let rx = self.router.register_single(&job_id);
        self.publish_request(payload.into(), &job_id, false).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(Error::JobDropped { job_id }),
            Err(_) => {
                self.router.forget(&job_id);
                Err(Error::Timeout { job_id, timeout })
            }
        }
    }

    /// Submits a job whose response is a stream, returning as soon as the
    /// request is published.
    ///
    /// `timeout` bounds the wait for each item of the returned stream.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] if the client is shutting down.
    /// - The broker error if the request could not be published.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip_all, fields(job_id))
    )]
    pub async fn submit_stream(
        &self,
        payload: impl Into<Bytes>,
        job_id: Option<String>,
        timeout: Duration,
    ) -> Result<OrderedStream<Bytes>> {
        if self.endpoint.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        let job_id = job_id.unwrap_or_else(new_job_id);
        #[cfg(feature = "tracing")]
        tracing::Span::current().record("job_id", job_id.as_str());

        let (writer, stream) = ordered_stream(timeout);
        self.router.register_stream(&job_id, writer);
        self.publish_request(payload.into(), &job_id, true).await?;
        Ok(stream)
    }

    async fn publish_request(&self, payload: Bytes, job_id: &str, stream: bool) -> Result<()> {
        let mut request = Message::new(payload)
            .with_attribute(ATTR_JOB_ID, job_id)
            .with_attribute(ATTR_HOST_ID, self.host_id().as_str());
        if stream {
            request.set_attribute(ATTR_RESPONSE_TYPE, RESPONSE_TYPE_STREAM);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(job_id, stream, "Submitting job");
        if let Err(e) = self.endpoint.publish(vec![request]).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(job_id, "Failed to publish request: {e}");
            self.router.forget(job_id);
            return Err(e);
        }
        Ok(())
    }

    /// Stops the consumer and drains the ack/nack queues.
    pub async fn shutdown(&self) {
        self.endpoint.shutdown().await;
    }

    /// Deletes the private subscription and closes the broker handle.
    ///
    /// # Errors
    ///
    /// Returns the first broker error encountered.
    pub async fn cleanup(&self) -> Result<()> {
        self.endpoint.cleanup().await
    }
}

/// Periodically drops expired job registrations.
async fn sweep_jobs(router: Arc<ResponseRouter>, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {
                let _purged = router.purge_expired();
                #[cfg(feature = "tracing")]
                if _purged > 0 {
                    tracing::debug!(purged = _purged, "Evicted expired jobs");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ResponseRouter {
        ResponseRouter::new(&RpcConfig::default())
    }

    fn response(job_id: &str, data: &str) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: "ack".to_string(),
            message_id: "1".to_string(),
            delivery_attempt: 1,
            message: Message::new(data.to_string()).with_attribute(ATTR_JOB_ID, job_id),
        }
    }

    fn chunk(job_id: &str, data: &str, order: u64, sender: &str) -> ReceivedMessage {
        let mut message = response(job_id, data);
        message
            .message
            .set_attribute(ATTR_MESSAGE_ORDER, order.to_string());
        message.message.set_attribute(ATTR_SENDER, sender);
        message
    }

    fn eos(job_id: &str, total: u64, sender: &str) -> ReceivedMessage {
        let mut message = chunk(job_id, "", total, sender);
        message.message.set_attribute(ATTR_EOS, EOS_MARKER);
        message
    }

    #[tokio::test]
    async fn resolves_single_result_once() {
        let router = router();
        let rx = router.register_single("job");
        router.on_message(&response("job", "pong")).await.unwrap();
        assert_eq!(rx.await.unwrap().as_ref(), b"pong");
        assert_eq!(router.pending(), 0);

        // A duplicate delivery finds nothing to resolve.
        router.on_message(&response("job", "pong")).await.unwrap();
    }

    #[tokio::test]
    async fn ignores_unknown_and_missing_job_ids() {
        let router = router();
        router.on_message(&response("nobody", "x")).await.unwrap();

        let mut orphan = response("nobody", "x");
        orphan.message.attributes.remove(ATTR_JOB_ID);
        router.on_message(&orphan).await.unwrap();
    }

    #[tokio::test]
    async fn stream_binding_released_after_end_marker_is_delivered() {
        let router = router();
        let (writer, stream) = ordered_stream(Duration::from_secs(1));
        router.register_stream("job", writer);

        // The end marker overtakes the chunks.
        router.on_message(&eos("job", 2, "srv")).await.unwrap();
        assert_eq!(router.pending(), 1);
        router.on_message(&chunk("job", "b", 1, "srv")).await.unwrap();
        router.on_message(&chunk("job", "a", 0, "srv")).await.unwrap();
        assert_eq!(router.pending(), 0);

        let items = stream.try_collect().await.unwrap();
        assert_eq!(items, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[tokio::test]
    async fn malformed_stream_response_fails_the_stream() {
        let router = router();
        let (writer, mut stream) = ordered_stream(Duration::from_secs(1));
        router.register_stream("job", writer);

        let malformed = response("job", "a");
        let err = router.on_message(&malformed).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert_eq!(router.pending(), 0);
        assert!(matches!(
            stream.next().await,
            Some(Err(Error::ProtocolViolation { .. }))
        ));
    }

    #[tokio::test]
    async fn second_sender_fails_the_stream() {
        let router = router();
        let (writer, mut stream) = ordered_stream(Duration::from_secs(1));
        router.register_stream("job", writer);

        router.on_message(&chunk("job", "a", 0, "srv-1")).await.unwrap();
        assert!(router.on_message(&chunk("job", "b", 1, "srv-2")).await.is_err());

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("a"));
        assert!(matches!(
            stream.next().await,
            Some(Err(Error::ProtocolViolation { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_jobs_are_swept() {
        let config = RpcConfig {
            job_cache_ttl: Duration::from_secs(10),
            ..RpcConfig::default()
        };
        let router = ResponseRouter::new(&config);
        let rx = router.register_single("job");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(router.purge_expired(), 1);
        assert!(rx.await.is_err());
    }
}
