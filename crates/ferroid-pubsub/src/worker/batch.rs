use crate::common::Result;
use core::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Long-running task that drains `rx` in size- or time-bounded batches.
///
/// Each iteration opens a batch window and collects items until either
/// `batch_size` items are buffered or `max_wait` has elapsed since the window
/// opened. Non-empty batches are handed to `on_items`. Errors returned by
/// `on_items` are logged and the loop continues: acks, nacks and publishes are
/// best-effort, and the broker's redelivery covers anything lost.
///
/// # Shutdown
///
/// When `shutdown` is cancelled, or every sender of `rx` has been dropped, the
/// worker stops waiting, drains whatever is still queued without blocking,
/// and flushes it (together with the partially collected window) through one
/// final `on_items` call before returning.
///
/// # Arguments
///
/// - `name`: Worker name used in logs (`acker`, `nacker`, `publisher`).
/// - `rx`: Queue feeding the worker.
/// - `max_wait`: Upper bound on how long an item can sit in an open window.
/// - `batch_size`: Maximum number of items per `on_items` call.
/// - `shutdown`: Token that triggers the final drain.
/// - `on_items`: Flush callback.
pub async fn batch_worker<T, F, Fut>(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<T>,
    max_wait: Duration,
    batch_size: usize,
    shutdown: CancellationToken,
    mut on_items: F,
) where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    #[cfg(feature = "tracing")]
    tracing::debug!(worker = name, "Batch worker started");
    let batch_size = batch_size.max(1);

    let mut batch = Vec::with_capacity(batch_size);
    loop {
        // An unrepresentable deadline means the window only closes when full.
        let deadline = Instant::now().checked_add(max_wait);
        let stopping = loop {
            if batch.len() >= batch_size {
                break false;
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break true,
                item = rx.recv() => match item {
                    Some(item) => batch.push(item),
                    None => break true,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => break false,
            }
        };

        if stopping {
            break;
        }

        if !batch.is_empty() {
            let items = core::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            flush(name, &mut on_items, items).await;
        }
    }

    #[cfg(feature = "tracing")]
    tracing::info!(worker = name, "Draining queue before shutdown");
    while let Ok(item) = rx.try_recv() {
        batch.push(item);
    }
    let _drained = batch.len();
    if !batch.is_empty() {
        flush(name, &mut on_items, batch).await;
    }
    #[cfg(feature = "tracing")]
    tracing::info!(worker = name, drained = _drained, "Batch worker drained");
}

async fn flush<T, F, Fut>(_name: &'static str, on_items: &mut F, items: Vec<T>)
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let _count = items.len();
    match on_items(items).await {
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!(worker = _name, count = _count, "Failed to process batch: {_e}");
        }
        Ok(()) => {
            #[cfg(feature = "tracing")]
            tracing::trace!(worker = _name, count = _count, "Flushed batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Batches = Arc<Mutex<Vec<(Instant, Vec<u32>)>>>;

    fn spawn_worker(
        rx: mpsc::UnboundedReceiver<u32>,
        max_wait: Duration,
        batch_size: usize,
        shutdown: CancellationToken,
    ) -> (Batches, tokio::task::JoinHandle<()>) {
        let batches: Batches = Arc::default();
        let sink = Arc::clone(&batches);
        let handle = tokio::spawn(batch_worker(
            "test",
            rx,
            max_wait,
            batch_size,
            shutdown,
            move |items| {
                sink.lock().push((Instant::now(), items));
                async { Ok(()) }
            },
        ));
        (batches, handle)
    }

    fn sizes(batches: &Batches) -> Vec<usize> {
        batches.lock().iter().map(|(_, b)| b.len()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn full_batches_flush_without_waiting() {
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..10 {
            tx.send(i).unwrap();
        }
        let start = Instant::now();
        let max_wait = Duration::from_secs(60);
        let (batches, _handle) = spawn_worker(rx, max_wait, 4, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(1)).await;

        let recorded = batches.lock().clone();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].1, vec![0, 1, 2, 3]);
        assert_eq!(recorded[1].1, vec![4, 5, 6, 7]);
        for (at, _) in &recorded {
            assert!(at.duration_since(start) < max_wait);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_when_window_closes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let (batches, _handle) =
            spawn_worker(rx, Duration::from_millis(100), 10, CancellationToken::new());

        tx.send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(2).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let recorded = batches.lock().clone();
        assert_eq!(sizes(&batches), vec![1, 1]);
        assert_eq!(recorded[0].1, vec![1]);
        assert_eq!(recorded[1].1, vec![2]);
        let first = recorded[0].0.duration_since(start);
        let second = recorded[1].0.duration_since(start);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(150));
        assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_flushes_everything_queued() {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (batches, handle) = spawn_worker(rx, Duration::from_secs(60), 100, shutdown.clone());

        tx.send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        for i in 2..=5 {
            tx.send(i).unwrap();
        }
        shutdown.cancel();
        handle.await.unwrap();

        let recorded = batches.lock().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_window_still_flushes_full_batches() {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (batches, handle) = spawn_worker(rx, Duration::MAX, 2, shutdown.clone());

        for i in 0..5 {
            tx.send(i).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(sizes(&batches), vec![2, 2]);

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(sizes(&batches), vec![2, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_senders_stop_the_worker() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (batches, handle) =
            spawn_worker(rx, Duration::from_secs(60), 100, CancellationToken::new());
        tx.send(7).unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(batches.lock()[0].1, vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_errors_do_not_stop_the_worker() {
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let calls = Arc::new(Mutex::new(0_usize));
        let counter = Arc::clone(&calls);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(batch_worker(
            "failing",
            rx,
            Duration::from_millis(10),
            1,
            shutdown.clone(),
            move |_items| {
                *counter.lock() += 1;
                async { Err(Error::broker("acknowledge", "unavailable")) }
            },
        ));

        for i in 0..3 {
            tx.send(i).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(*calls.lock(), 3);
    }
}
