//! Client-facing SSE output channel
//!
//! The relay task writes frames into a bounded channel; the receiving end is
//! the body of the HTTP response handed back to axum. When the client goes
//! away axum drops the body, which closes the channel and signals
//! cancellation to the relay.

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode, header},
};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Media type of every relayed stream
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";

const FRAME_SEPARATOR: &[u8] = b"\n\n";

type Chunk = Result<Bytes, std::io::Error>;

/// The client is no longer reading the stream
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("client disconnected")]
pub struct ClientGone;

/// Writer half of a streamed client response
pub struct ClientSink {
    tx: mpsc::Sender<Chunk>,
    pending: BytesMut,
    frames_written: usize,
}

impl ClientSink {
    /// Create a sink together with the response that streams what it writes.
    ///
    /// The response headers are final before the first frame is written.
    pub fn channel(capacity: usize) -> (Self, Response<Body>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(EVENT_STREAM_CONTENT_TYPE),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let sink = Self {
            tx,
            pending: BytesMut::new(),
            frames_written: 0,
        };
        (sink, response)
    }

    /// Queue one line followed by the blank-line separator
    pub fn write_frame(&mut self, line: &str) {
        self.pending.extend_from_slice(line.as_bytes());
        self.pending.extend_from_slice(FRAME_SEPARATOR);
        self.frames_written += 1;
    }

    /// Hand everything queued so far to the client
    pub async fn flush(&mut self) -> Result<(), ClientGone> {
        if self.pending.is_empty() {
            return if self.tx.is_closed() {
                Err(ClientGone)
            } else {
                Ok(())
            };
        }

        let chunk = self.pending.split().freeze();
        self.tx.send(Ok(chunk)).await.map_err(|_| ClientGone)
    }

    /// Resolves once the client has stopped reading
    pub async fn cancelled(&self) {
        self.tx.closed().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Number of frames written so far
    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    /// End the body abnormally so the client sees a broken stream, not a clean finish
    pub async fn abort(mut self, message: String) {
        if !self.pending.is_empty() {
            let chunk = self.pending.split().freeze();
            if self.tx.send(Ok(chunk)).await.is_err() {
                return;
            }
        }
        let _ = self.tx.send(Err(std::io::Error::other(message))).await;
    }
}
