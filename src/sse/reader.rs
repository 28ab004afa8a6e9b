//! Async adapter from a byte stream to a frame stream.

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FrameParser, SseFrame};

/// Turn a byte stream into a lazy stream of dispatched frames.
///
/// The byte source is polled one chunk at a time; cancelling `cancel` stops
/// reading and ends the stream. Frames yielded before cancellation stand.
/// When the source ends, any buffered trailing line is flushed as a final
/// best-effort frame.
pub fn frames<S>(bytes: S, cancel: CancellationToken) -> impl Stream<Item = SseFrame>
where
    S: Stream<Item = Bytes>,
{
    stream! {
        tokio::pin!(bytes);
        let mut parser = FrameParser::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("frame stream aborted");
                    break;
                }
                chunk = bytes.next() => chunk,
            };
            match next {
                Some(chunk) => {
                    for frame in parser.push(&chunk) {
                        yield frame;
                    }
                }
                None => {
                    if let Some(frame) = parser.finish() {
                        yield frame;
                    }
                    break;
                }
            }
        }
    }
}
