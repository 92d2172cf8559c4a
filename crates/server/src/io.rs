//! Streaming response plumbing.
//!
//! `/git-upload-pack` responses are produced incrementally by a command
//! task and streamed to the client through a channel. The channel's
//! closed-signal doubles as cancellation: when the client disconnects,
//! axum drops the body stream and every pending write fails.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use goblet_core::pktline::Packet;
use goblet_core::protocol::{ResponseChunk, encode_response};
use goblet_core::{Status, StatusResult};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

pub(crate) type BodyItem = Result<Bytes, Infallible>;

/// Write side of a streamed response body.
pub(crate) struct ResponseSink {
    tx: mpsc::Sender<BodyItem>,
}

impl ResponseSink {
    pub(crate) fn new(tx: mpsc::Sender<BodyItem>) -> Self {
        Self { tx }
    }

    /// Send raw bytes; a closed channel means the client went away.
    pub(crate) async fn send(&self, bytes: Bytes) -> StatusResult<()> {
        self.tx
            .send(Ok(bytes))
            .await
            .map_err(|_| Status::canceled("client IO error"))
    }

    /// Forward response chunks verbatim.
    pub(crate) async fn send_response(&self, chunks: &[ResponseChunk]) -> StatusResult<()> {
        self.send(encode_response(chunks)).await
    }

    /// Write an error packet; best-effort, the client may be gone.
    pub(crate) async fn send_error_packet(&self, status: &Status) {
        let _ = self.send(Packet::error(&status.to_string()).encode()).await;
    }

    /// Resolves when the client has disconnected.
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }

    /// An `AsyncWrite` view for streaming subprocess output.
    pub(crate) fn writer(&self) -> SinkWriter {
        SinkWriter {
            tx: PollSender::new(self.tx.clone()),
        }
    }
}

/// `AsyncWrite` adapter over the response channel.
pub(crate) struct SinkWriter {
    tx: PollSender<BodyItem>,
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "response channel closed")
}

impl AsyncWrite for SinkWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                if self
                    .tx
                    .send_item(Ok(Bytes::copy_from_slice(buf)))
                    .is_err()
                {
                    return Poll::Ready(Err(broken_pipe()));
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
