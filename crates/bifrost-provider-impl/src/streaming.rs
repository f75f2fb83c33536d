//! Shared plumbing that turns an upstream SSE byte stream into ordered
//! [`StreamChunk`]s. Each adapter supplies a [`StreamDecoder`] for its wire
//! format; the pump task, sequencing, and cancellation handling live here.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use bifrost_common::BifrostError;
use bifrost_provider_core::{ChunkDelta, ChunkStream, StreamChunk, StreamEnd};

use crate::sse::SseFrame;

pub enum StreamStep {
    Skip,
    Delta(ChunkDelta),
    End(StreamEnd),
    Fail(BifrostError),
}

/// Stateful per-stream decoder fed one SSE frame at a time. `take_end`
/// produces the terminal marker when the upstream closes without one.
pub trait StreamDecoder {
    fn frame(&mut self, frame: &SseFrame) -> StreamStep;
    fn take_end(&mut self) -> StreamEnd;
}

/// Pumps upstream SSE bytes through a decoder into a chunk channel with
/// strictly increasing `seq`. Exactly one terminal chunk is emitted on every
/// path: upstream end, decoder-signalled end or failure, and cancellation.
pub fn spawn_data_stream<D>(
    mut bytes_rx: tokio::sync::mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    mut decoder: D,
) -> ChunkStream
where
    D: StreamDecoder + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(32);
    tokio::spawn(async move {
        let mut sse = crate::sse::SseDecoder::new();
        let mut seq = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(StreamChunk::error(seq, BifrostError::cancelled())).await;
                    return;
                }
                chunk = bytes_rx.recv() => chunk,
            };

            let frames = match &chunk {
                Some(bytes) => sse.feed(bytes),
                None => sse.finish(),
            };

            for frame in frames {
                match decoder.frame(&frame) {
                    StreamStep::Skip => {}
                    StreamStep::Delta(delta) => {
                        let sent = tx.send(StreamChunk::delta(seq, delta)).await;
                        seq += 1;
                        if sent.is_err() {
                            // Consumer dropped the stream; closing bytes_rx
                            // releases the connection.
                            return;
                        }
                    }
                    StreamStep::End(end) => {
                        let _ = tx.send(StreamChunk::end(seq, end)).await;
                        return;
                    }
                    StreamStep::Fail(err) => {
                        tracing::debug!(kind = err.kind.as_str(), "stream decode failed");
                        let _ = tx.send(StreamChunk::error(seq, err)).await;
                        return;
                    }
                }
            }

            if chunk.is_none() {
                // Upstream closed without a terminal frame; surface what the
                // decoder accumulated rather than hanging the consumer.
                let _ = tx.send(StreamChunk::end(seq, decoder.take_end())).await;
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_provider_core::FinishReason;

    /// Echoes `data:` payloads as text deltas, ending on "END".
    struct EchoDecoder;

    impl StreamDecoder for EchoDecoder {
        fn frame(&mut self, frame: &SseFrame) -> StreamStep {
            if frame.data == "END" {
                StreamStep::End(StreamEnd {
                    finish_reason: Some(FinishReason::Stop),
                    usage: None,
                })
            } else {
                StreamStep::Delta(ChunkDelta::text(frame.data.clone()))
            }
        }

        fn take_end(&mut self) -> StreamEnd {
            StreamEnd::default()
        }
    }

    #[tokio::test]
    async fn sequences_chunks_and_emits_single_terminal() {
        let (btx, brx) = tokio::sync::mpsc::channel(4);
        let mut rx = spawn_data_stream(brx, CancellationToken::new(), EchoDecoder);

        btx.send(Bytes::from("data: a\n\ndata: b\n\n")).await.unwrap();
        btx.send(Bytes::from("data: END\n\n")).await.unwrap();
        drop(btx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(first.delta.unwrap().text.as_deref(), Some("a"));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 1);

        let last = rx.recv().await.unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.end.unwrap().finish_reason, Some(FinishReason::Stop));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn upstream_close_without_terminal_still_ends_stream() {
        let (btx, brx) = tokio::sync::mpsc::channel(4);
        let mut rx = spawn_data_stream(brx, CancellationToken::new(), EchoDecoder);

        btx.send(Bytes::from("data: only\n\n")).await.unwrap();
        drop(btx);

        assert!(rx.recv().await.unwrap().delta.is_some());
        let last = rx.recv().await.unwrap();
        assert!(last.end.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_yields_error_chunk() {
        let (_btx, brx) = tokio::sync::mpsc::channel::<Bytes>(4);
        let cancel = CancellationToken::new();
        let mut rx = spawn_data_stream(brx, cancel.clone(), EchoDecoder);

        cancel.cancel();
        let last = rx.recv().await.unwrap();
        assert!(last.error.is_some());
        assert!(rx.recv().await.is_none());
    }
}
