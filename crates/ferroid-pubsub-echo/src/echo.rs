use bytes::Bytes;
use ferroid_pubsub::{Message, Processor, ReceivedMessage, Result};
use futures::{StreamExt, stream::BoxStream};

/// Echoes plain requests and streams the payload back in pieces.
#[derive(Debug, Clone, Copy)]
pub struct EchoProcessor {
    pub stream_chunks: usize,
}

impl Processor for EchoProcessor {
    async fn process_message(&self, message: &ReceivedMessage) -> Result<Vec<Message>> {
        Ok(vec![Message::new(message.data().clone())])
    }

    fn process_stream_message(&self, message: ReceivedMessage) -> BoxStream<'static, Result<Message>> {
        let pieces = split(message.data(), self.stream_chunks);
        futures::stream::iter(pieces)
            .map(|piece| Ok(Message::new(piece)))
            .boxed()
    }
}

/// Splits `data` into at most `pieces` contiguous, non-empty slices.
pub fn split(data: &Bytes, pieces: usize) -> Vec<Bytes> {
    if data.is_empty() {
        return Vec::new();
    }
    let size = data.len().div_ceil(pieces.max(1));
    (0..data.len())
        .step_by(size)
        .map(|start| data.slice(start..(start + size).min(data.len())))
        .collect()
}
