use super::endpoint::{Endpoint, subscription_path, topic_path};
use crate::{
    broker::{Broker, SubscriptionConfig},
    common::{
        ATTR_EOS, ATTR_JOB_ID, ATTR_MESSAGE_ORDER, ATTR_RESPONSE_TYPE, ATTR_SENDER, EOS_MARKER,
        Error, HostId, Message, RESPONSE_TYPE_STREAM, ReceivedMessage, Result,
    },
    config::RpcConfig,
    worker::{MessageHandler, batch_worker},
};
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// User-supplied request handlers.
///
/// Implement [`Processor::process_message`] to answer plain requests and
/// [`Processor::process_stream_message`] to answer requests tagged
/// `response-type = "stream"`. Both default to
/// [`Error::NotImplemented`], which nacks the request.
///
/// A request can be delivered more than once (after a nack, an expired
/// lease, or a duplicate publish), so handlers must be safe to re-run.
pub trait Processor: Send + Sync + 'static {
    /// Produces the responses to a plain request. Each response inherits the
    /// request's attributes before being published.
    fn process_message(
        &self,
        message: &ReceivedMessage,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send {
        let _ = message;
        async {
            Err(Error::NotImplemented {
                operation: "process_message",
            })
        }
    }

    /// Produces the chunks of a streamed response, in order. The stream is
    /// finite; an error item aborts it without an end-of-stream marker.
    fn process_stream_message(
        &self,
        message: ReceivedMessage,
    ) -> BoxStream<'static, Result<Message>> {
        let _ = message;
        futures::stream::once(async {
            Err(Error::NotImplemented {
                operation: "process_stream_message",
            })
        })
        .boxed()
    }
}

/// Dispatches requests to a [`Processor`] and queues the responses.
struct RequestDispatcher<P> {
    processor: P,
    host_id: HostId,
    publish_tx: mpsc::UnboundedSender<Message>,
    stream_buffer_size: usize,
}

impl<P: Processor> RequestDispatcher<P> {
    fn enqueue(&self, response: Message) -> Result<()> {
        self.publish_tx
            .send(response)
            .map_err(|e| Error::ChannelError {
                context: format!("publish queue closed: {e}"),
            })
    }

    async fn respond(&self, request: &ReceivedMessage) -> Result<()> {
        let responses = self.processor.process_message(request).await?;
        #[cfg(feature = "tracing")]
        tracing::debug!(count = responses.len(), "Queueing responses");
        for mut response in responses {
            response.merge_attributes(request.attributes());
            self.enqueue(response)?;
        }
        Ok(())
    }

    /// Forwards the handler's stream through a bounded channel, numbering
    /// every chunk, and closes it with an end-of-stream marker.
    async fn respond_stream(&self, request: &ReceivedMessage) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(self.stream_buffer_size);
        let mut chunks = self.processor.process_stream_message(request.clone());
        let producer = tokio::spawn(async move {
            while let Some(chunk) = chunks.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });

        let mut order: u64 = 0;
        while let Some(chunk) = rx.recv().await {
            let mut response = match chunk {
                Ok(response) => response,
                Err(e) => {
                    producer.abort();
                    #[cfg(feature = "tracing")]
                    tracing::warn!(sent = order, "Stream handler failed mid-stream: {e}");
                    return Err(e);
                }
            };
            response.merge_attributes(request.attributes());
            response.set_attribute(ATTR_MESSAGE_ORDER, order.to_string());
            response.set_attribute(ATTR_SENDER, self.host_id.as_str());
            self.enqueue(response)?;
            order += 1;
        }

        producer
            .await
            .map_err(|e| Error::handler(format!("stream producer failed: {e}")))?;

        let mut eos = Message::new(Bytes::new());
        eos.merge_attributes(request.attributes());
        eos.set_attribute(ATTR_EOS, EOS_MARKER);
        eos.set_attribute(ATTR_MESSAGE_ORDER, order.to_string());
        eos.set_attribute(ATTR_SENDER, self.host_id.as_str());
        self.enqueue(eos)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(count = order, "Stream complete");
        Ok(())
    }
}

impl<P: Processor> MessageHandler for RequestDispatcher<P> {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<()> {
        let job_id = message.attribute(ATTR_JOB_ID).unwrap_or_default();
        match message.attribute(ATTR_RESPONSE_TYPE) {
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(job_id, "Processing request");
                self.respond(message).await
            }
            Some(RESPONSE_TYPE_STREAM) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(job_id, "Processing stream request");
                self.respond_stream(message).await
            }
            Some(other) => Err(Error::protocol(format!(
                "unexpected response-type {other:?} on job {job_id:?}"
            ))),
        }
    }
}

/// Answers requests from a shared subscription.
///
/// Any number of servers can share the same subscription; the broker spreads
/// requests among them. Responses are batched by a publisher worker and sent
/// to the response topic with every attribute of the request, so they reach
/// the client that asked.
#[derive(Debug)]
pub struct RpcServer<B> {
    endpoint: Endpoint<B>,
    publish_tx: mpsc::UnboundedSender<Message>,
    publish_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl<B: Broker> RpcServer<B> {
    /// Creates a server consuming `request_topic` through the subscription
    /// named `subscription_name`, and answering on `response_topic`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        broker: Arc<B>,
        project_id: &str,
        subscription_name: &str,
        request_topic: &str,
        response_topic: &str,
        config: RpcConfig,
    ) -> Result<Self> {
        let endpoint = Endpoint::new(
            broker,
            config,
            HostId::generate(),
            subscription_path(project_id, subscription_name),
            topic_path(project_id, request_topic),
            topic_path(project_id, response_topic),
        )?;
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        Ok(Self {
            endpoint,
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
        })
    }

    pub const fn endpoint(&self) -> &Endpoint<B> {
        &self.endpoint
    }

    pub const fn host_id(&self) -> &HostId {
        self.endpoint.host_id()
    }

    /// Creates the request subscription with exactly-once delivery requested.
    ///
    /// An existing subscription is not an error: it is how several servers
    /// share the request load.
    ///
    /// # Errors
    ///
    /// Returns any other broker error.
    pub async fn initialize(&self, config: Option<SubscriptionConfig>) -> Result<()> {
        let config = SubscriptionConfig {
            exactly_once: true,
            ..config.unwrap_or_default()
        };
        match self.endpoint.create_subscription(config).await {
            Err(Error::SubscriptionExists { .. }) => {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    subscription = %self.endpoint.subscription(),
                    "Joining existing subscription"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Starts the consumer, the ack/nack workers and the response publisher,
    /// handing requests to `processor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call, or
    /// [`Error::ServiceShutdown`] after shutdown.
    pub fn startup<P: Processor>(&self, processor: P) -> Result<()> {
        if self.endpoint.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        let Some(publish_rx) = self.publish_rx.lock().take() else {
            return Err(Error::AlreadyStarted);
        };

        let dispatcher = Arc::new(RequestDispatcher {
            processor,
            host_id: self.host_id().clone(),
            publish_tx: self.publish_tx.clone(),
            stream_buffer_size: self.endpoint.config().stream_buffer_size,
        });
        self.endpoint.start(dispatcher)?;

        let broker = Arc::clone(self.endpoint.broker());
        let topic = self.endpoint.outbound_topic().to_string();
        let config = self.endpoint.config();
        let (max_wait, batch_size) = (config.publish_max_wait, config.publish_batch_size);
        self.endpoint.spawn_worker(move |token| {
            batch_worker(
                "publisher",
                publish_rx,
                max_wait,
                batch_size,
                token,
                move |messages| {
                    let broker = Arc::clone(&broker);
                    let topic = topic.clone();
                    async move { broker.publish(&topic, messages).await.map(|_| ()) }
                },
            )
        });
        Ok(())
    }

    /// Stops the consumer, then flushes queued acks, nacks and responses.
    pub async fn shutdown(&self) {
        self.endpoint.shutdown().await;
    }

    /// Deletes the request subscription and closes the broker handle.
    ///
    /// # Errors
    ///
    /// Returns the first broker error encountered.
    pub async fn cleanup(&self) -> Result<()> {
        self.endpoint.cleanup().await
    }
}
