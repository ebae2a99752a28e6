use crate::{
    broker::Broker,
    common::{ReceivedMessage, Result},
};
use core::time::Duration;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

/// Role-specific processing of one inbound message.
///
/// Returning `Ok` acks the message; returning an error nacks it, which makes
/// the broker redeliver it immediately. Implementations must therefore be
/// safe to run more than once for the same message.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: &ReceivedMessage) -> impl Future<Output = Result<()>> + Send;
}

/// Settings for [`consume_loop`].
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub subscription: String,
    pub concurrency_limit: usize,
    pub poll_interval: Duration,
    pub min_poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

/// Long-running task that pulls messages and processes them concurrently.
///
/// Every iteration pulls at most `concurrency_limit - in_flight` messages and
/// spawns one task per message. A task that completes successfully pushes
/// its ack id onto `ack_tx`; a failed one pushes it onto `nack_tx`. The loop
/// then sleeps for what remains of `poll_interval`, but never less than
/// `min_poll_interval`, so empty pulls do not hammer the broker. Pull failures
/// are logged and retried on the next iteration.
///
/// On cancellation the loop stops pulling and gives in-flight handlers up to
/// `shutdown_timeout` to finish so their outcomes reach the ack/nack queues.
/// Handlers still running after that are aborted; the broker redelivers their
/// messages once the ack deadline lapses.
pub async fn consume_loop<B, H>(
    broker: Arc<B>,
    handler: Arc<H>,
    settings: ConsumerSettings,
    ack_tx: mpsc::UnboundedSender<String>,
    nack_tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
) where
    B: Broker,
    H: MessageHandler,
{
    let subscription = settings.subscription.as_str();
    #[cfg(feature = "tracing")]
    tracing::info!(subscription, "Consumer started");

    let mut in_flight = JoinSet::new();

    while !shutdown.is_cancelled() {
        let start = Instant::now();
        reap(&mut in_flight);

        let capacity = settings.concurrency_limit.saturating_sub(in_flight.len());
        if capacity > 0 {
            let pulled = tokio::select! {
                () = shutdown.cancelled() => break,
                pulled = broker.pull(subscription, capacity) => pulled,
            };
            match pulled {
                Ok(messages) => {
                    for message in messages {
                        in_flight.spawn(process(
                            Arc::clone(&handler),
                            message,
                            ack_tx.clone(),
                            nack_tx.clone(),
                        ));
                    }
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(subscription, "Failed to pull messages: {_e}");
                }
            }
        }

        let sleep_for = settings
            .poll_interval
            .saturating_sub(start.elapsed())
            .max(settings.min_poll_interval);
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(sleep_for) => {}
        }
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        subscription,
        "Consumer cancelled, draining {} in-flight handlers",
        in_flight.len()
    );
    let drained = tokio::time::timeout(settings.shutdown_timeout, async {
        while let Some(joined) = in_flight.join_next().await {
            log_join_error(joined);
        }
    })
    .await;

    if drained.is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            subscription,
            "Aborting {} handlers still running after {:?}",
            in_flight.len(),
            settings.shutdown_timeout
        );
        in_flight.shutdown().await;
    }

    #[cfg(feature = "tracing")]
    tracing::info!(subscription, "Consumer stopped");
}

/// Runs the handler for one message and routes the outcome.
async fn process<H: MessageHandler>(
    handler: Arc<H>,
    message: ReceivedMessage,
    ack_tx: mpsc::UnboundedSender<String>,
    nack_tx: mpsc::UnboundedSender<String>,
) {
    let (queue, ack_id) = match handler.on_message(&message).await {
        Ok(()) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(message_id = %message.message_id, "Adding to ack queue");
            (&ack_tx, message.ack_id)
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                message_id = %message.message_id,
                attempt = message.delivery_attempt,
                "Handler failed, adding to nack queue: {_e}"
            );
            (&nack_tx, message.ack_id)
        }
    };

    if let Err(_e) = queue.send(ack_id) {
        #[cfg(feature = "tracing")]
        tracing::error!("Failed to enqueue ack outcome: {_e}");
    }
}

fn reap(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.try_join_next() {
        log_join_error(joined);
    }
}

fn log_join_error(joined: core::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            #[cfg(feature = "tracing")]
            tracing::error!("Message handler panicked: {e}");
        }
    }
}
