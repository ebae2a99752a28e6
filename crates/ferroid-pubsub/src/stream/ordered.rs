//! Per-job reassembly of out-of-order stream chunks.
//!
//! The transport delivers chunks of a stream in any order and possibly more
//! than once. Each chunk carries its position (`message_order`) and the
//! identity of the server that produced it (`sender`). An ordered stream
//! releases chunks to its consumer strictly in position order:
//!
//! - `order == expected`: the chunk is released, followed by every buffered
//!   chunk that is now contiguous.
//! - `order < expected`: the chunk is a duplicate and is discarded.
//! - `order > expected`: the chunk is buffered until the gap is filled.
//!
//! The end-of-stream marker travels through the same path at position
//! `total_count`, so it is only released after every chunk before it.
//!
//! The producer half ([`StreamWriter`]) and the consumer half
//! ([`OrderedStream`]) are connected by an unbounded channel. The writer side
//! is synchronous so it can be driven from inside a short critical section.

use crate::common::{Error, Result};
use core::time::Duration;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A slot in the reassembly buffer: either a data chunk or the end marker.
#[derive(Debug)]
enum Chunk<T> {
    Item(T),
    End,
}

#[derive(Debug)]
struct Reorder<T> {
    expected_order: u64,
    pending: BTreeMap<u64, Chunk<T>>,
    bound_sender: Option<String>,
    terminated: bool,
    out: mpsc::UnboundedSender<Result<Chunk<T>>>,
}

impl<T> Reorder<T> {
    fn bind_sender(&mut self, sender: &str) -> Result<()> {
        match &self.bound_sender {
            None => {
                self.bound_sender = Some(sender.to_owned());
                Ok(())
            }
            Some(bound) if bound == sender => Ok(()),
            Some(bound) => Err(Error::protocol(format!(
                "stream bound to sender {bound} received a chunk from {sender}"
            ))),
        }
    }

    fn accept(&mut self, chunk: Chunk<T>, order: u64, sender: &str) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.bind_sender(sender)?;

        if order < self.expected_order {
            #[cfg(feature = "tracing")]
            tracing::trace!(order, expected = self.expected_order, "Dropping duplicate chunk");
            return Ok(());
        }

        if order > self.expected_order {
            self.pending.entry(order).or_insert(chunk);
            return Ok(());
        }

        self.release(chunk);
        while !self.terminated {
            match self.pending.remove(&self.expected_order) {
                Some(next) => self.release(next),
                None => break,
            }
        }
        Ok(())
    }

    fn release(&mut self, chunk: Chunk<T>) {
        self.expected_order += 1;
        if matches!(chunk, Chunk::End) {
            self.terminated = true;
            self.pending.clear();
        }
        // The consumer may have been dropped; there is nobody left to tell.
        let _ = self.out.send(Ok(chunk));
    }

    fn fail(&mut self, error: Error) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.pending.clear();
        let _ = self.out.send(Err(error));
    }
}

/// Producer half of an ordered stream.
///
/// Cloning a writer yields another handle onto the same reassembly state.
#[derive(Debug)]
pub struct StreamWriter<T> {
    state: Arc<Mutex<Reorder<T>>>,
}

impl<T> Clone for StreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> StreamWriter<T> {
    /// Offers the chunk at position `order` produced by `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] if the stream is already bound to
    /// a different sender. The stream itself is left untouched.
    pub fn add(&self, item: T, order: u64, sender: &str) -> Result<()> {
        self.state.lock().accept(Chunk::Item(item), order, sender)
    }

    /// Announces that the stream holds exactly `total_count` chunks.
    ///
    /// # Errors
    ///
    /// Same as [`StreamWriter::add`].
    pub fn signal_end_of_stream(&self, total_count: u64, sender: &str) -> Result<()> {
        self.state.lock().accept(Chunk::End, total_count, sender)
    }

    /// Terminates the stream with `error`, which the consumer observes as its
    /// next item.
    pub fn fail(&self, error: Error) {
        self.state.lock().fail(error);
    }

    /// Position of the next chunk the stream is waiting for.
    pub fn expected_order(&self) -> u64 {
        self.state.lock().expected_order
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }
}

/// Consumer half of an ordered stream.
///
/// Every call to [`OrderedStream::next`] waits at most `timeout` for the next
/// chunk. A stream that stays silent for longer than that is considered
/// stalled (a lost chunk, or a sender that died mid-stream) and fails.
#[derive(Debug)]
pub struct OrderedStream<T> {
    rx: mpsc::UnboundedReceiver<Result<Chunk<T>>>,
    timeout: Duration,
    finished: bool,
}

/// Creates a connected writer/consumer pair.
pub fn ordered_stream<T>(timeout: Duration) -> (StreamWriter<T>, OrderedStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = StreamWriter {
        state: Arc::new(Mutex::new(Reorder {
            expected_order: 0,
            pending: BTreeMap::new(),
            bound_sender: None,
            terminated: false,
            out: tx,
        })),
    };
    let stream = OrderedStream {
        rx,
        timeout,
        finished: false,
    };
    (writer, stream)
}

impl<T> OrderedStream<T> {
    /// Waits for the next chunk in order.
    ///
    /// Returns `None` once the end-of-stream marker has been consumed, and
    /// after any error has been returned.
    pub async fn next(&mut self) -> Option<Result<T>> {
        if self.finished {
            return None;
        }

        let outcome = match tokio::time::timeout(self.timeout, self.rx.recv()).await {
            Ok(Some(Ok(Chunk::Item(item)))) => return Some(Ok(item)),
            Ok(Some(Ok(Chunk::End))) => None,
            Ok(Some(Err(e))) => Some(Err(e)),
            Ok(None) => Some(Err(Error::StreamClosed)),
            Err(_) => Some(Err(Error::StreamStalled {
                timeout: self.timeout,
            })),
        };
        self.finished = true;
        outcome
    }

    /// Collects every remaining chunk, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error the stream produced.
    pub async fn try_collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Adapts this consumer into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const SENDER: &str = "server-a";
    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Heap's algorithm, iterative.
    fn permutations(n: usize) -> Vec<Vec<usize>> {
        let mut items: Vec<usize> = (0..n).collect();
        let mut out = vec![items.clone()];
        let mut c = vec![0; n];
        let mut i = 0;
        while i < n {
            if c[i] < i {
                if i % 2 == 0 {
                    items.swap(0, i);
                } else {
                    items.swap(c[i], i);
                }
                out.push(items.clone());
                c[i] += 1;
                i = 0;
            } else {
                c[i] = 0;
                i += 1;
            }
        }
        out
    }

    #[tokio::test]
    async fn every_arrival_order_yields_ascending_sequence() {
        const N: usize = 5;
        // Position N is the end marker.
        for arrival in permutations(N + 1) {
            let (writer, stream) = ordered_stream::<usize>(TIMEOUT);
            for &order in &arrival {
                if order == N {
                    writer.signal_end_of_stream(N as u64, SENDER).unwrap();
                } else {
                    writer.add(order, order as u64, SENDER).unwrap();
                }
            }
            let items = stream.try_collect().await.unwrap();
            assert_eq!(items, (0..N).collect::<Vec<_>>(), "arrival {arrival:?}");
        }
    }

    #[tokio::test]
    async fn duplicates_below_expected_are_ignored() {
        let (writer, mut stream) = ordered_stream::<&str>(TIMEOUT);
        writer.add("a", 0, SENDER).unwrap();
        writer.add("b", 1, SENDER).unwrap();
        writer.add("a-again", 0, SENDER).unwrap();
        writer.add("b-again", 1, SENDER).unwrap();
        assert_eq!(writer.expected_order(), 2);

        writer.signal_end_of_stream(2, SENDER).unwrap();
        assert_eq!(stream.next().await, Some(Ok("a")));
        assert_eq!(stream.next().await, Some(Ok("b")));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn buffered_duplicate_keeps_first_copy() {
        let (writer, stream) = ordered_stream::<&str>(TIMEOUT);
        writer.add("first", 1, SENDER).unwrap();
        writer.add("second", 1, SENDER).unwrap();
        writer.add("zero", 0, SENDER).unwrap();
        writer.signal_end_of_stream(2, SENDER).unwrap();
        assert_eq!(stream.try_collect().await, Ok(vec!["zero", "first"]));
    }

    #[tokio::test]
    async fn second_sender_is_a_protocol_violation() {
        let (writer, _stream) = ordered_stream::<u8>(TIMEOUT);
        writer.add(0, 0, SENDER).unwrap();
        let err = writer.add(1, 1, "server-b").unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));

        let err = writer.signal_end_of_stream(1, "server-b").unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert_eq!(writer.expected_order(), 1);
    }

    #[tokio::test]
    async fn end_marker_waits_for_missing_chunks() {
        let (writer, mut stream) = ordered_stream::<u8>(TIMEOUT);
        writer.signal_end_of_stream(2, SENDER).unwrap();
        writer.add(1, 1, SENDER).unwrap();
        assert!(!writer.is_terminated());

        writer.add(0, 0, SENDER).unwrap();
        assert!(writer.is_terminated());
        assert_eq!(stream.next().await, Some(Ok(0)));
        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn adds_after_termination_are_ignored() {
        let (writer, stream) = ordered_stream::<u8>(TIMEOUT);
        writer.signal_end_of_stream(0, SENDER).unwrap();
        writer.add(7, 0, SENDER).unwrap();
        writer.add(8, 5, SENDER).unwrap();
        assert_eq!(stream.try_collect().await, Ok(vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_stalls() {
        let (writer, mut stream) = ordered_stream::<u8>(Duration::from_secs(2));
        writer.add(1, 1, SENDER).unwrap();

        assert_eq!(
            stream.next().await,
            Some(Err(Error::StreamStalled {
                timeout: Duration::from_secs(2)
            }))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn dropped_writer_closes_stream() {
        let (writer, mut stream) = ordered_stream::<u8>(TIMEOUT);
        writer.add(0, 0, SENDER).unwrap();
        drop(writer);
        assert_eq!(stream.next().await, Some(Ok(0)));
        assert_eq!(stream.next().await, Some(Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn failure_surfaces_to_consumer() {
        let (writer, stream) = ordered_stream::<u8>(TIMEOUT);
        writer.add(0, 0, SENDER).unwrap();
        writer.fail(Error::protocol("bad chunk"));
        writer.add(1, 1, SENDER).unwrap();

        let items: Vec<_> = stream.into_stream().collect().await;
        assert_eq!(items, vec![Ok(0), Err(Error::protocol("bad chunk"))]);
    }
}
