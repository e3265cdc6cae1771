//! The conversation relay state machine
//!
//! A session owns one client-facing stream. It pulls lines from the current
//! upstream response, relays them one frame at a time, and when a segment
//! ends on a truncated message it dispatches a `continue` request and keeps
//! writing into the same client stream.
//!
//! ```text
//! Sending -> Streaming -> (TruncatedContinuing -> Sending -> Streaming)* -> Done
//!                                                        \-> Cancelled | UpstreamError
//! ```

use std::sync::Arc;

use super::classify::{EventKind, TruncationPoint, classify};
use super::lines::LineReader;
use super::request::ConversationRequest;
use super::sink::ClientSink;
use super::upstream::{UpstreamClient, UpstreamResponse};
use crate::proxy::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Sending,
    Streaming,
    TruncatedContinuing,
    Done,
    Cancelled,
    UpstreamError,
}

/// How a relayed stream ended
#[derive(Debug)]
pub enum RelayOutcome {
    /// Every segment was relayed; `segments` counts upstream responses
    Done { segments: usize },
    /// The client went away
    Cancelled,
    /// The stream was aborted after it had started
    Failed(ProxyError),
}

enum SegmentEnd {
    Finished,
    Cancelled,
}

pub struct RelaySession<U: ?Sized> {
    upstream: Arc<U>,
    authorization: String,
    request: ConversationRequest,
    truncation: Option<TruncationPoint>,
    depth: usize,
    max_continuations: usize,
    state: RelayState,
}

impl<U> RelaySession<U>
where
    U: UpstreamClient + ?Sized,
{
    pub fn new(
        upstream: Arc<U>,
        authorization: String,
        request: ConversationRequest,
        max_continuations: usize,
    ) -> Self {
        Self {
            upstream,
            authorization,
            request,
            truncation: None,
            depth: 0,
            max_continuations,
            state: RelayState::Sending,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Number of continuation requests issued so far
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The request currently being relayed
    pub fn request(&self) -> &ConversationRequest {
        &self.request
    }

    /// Dispatch the current request and accept only a successful response.
    ///
    /// A rejection carries the upstream status and body; nothing is retried.
    pub async fn open(&mut self) -> Result<UpstreamResponse, ProxyError> {
        self.state = RelayState::Sending;

        let response = match self
            .upstream
            .send(&self.request, &self.authorization)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.state = RelayState::UpstreamError;
                return Err(e);
            }
        };

        if !response.status.is_success() {
            self.state = RelayState::UpstreamError;
            return Err(response.into_rejection().await);
        }

        Ok(response)
    }

    /// Relay `first` and every continuation it leads to into `sink`
    pub async fn run(&mut self, first: UpstreamResponse, mut sink: ClientSink) -> RelayOutcome {
        let mut response = first;
        let mut segments = 0;

        loop {
            segments += 1;
            self.state = RelayState::Streaming;

            if let SegmentEnd::Cancelled = self.stream_segment(response, &mut sink).await {
                return self.cancel(&sink);
            }

            let Some(point) = self.continuation_point() else {
                self.state = RelayState::Done;
                tracing::debug!(
                    segments,
                    frames = sink.frames_written(),
                    "Relayed stream completed"
                );
                return RelayOutcome::Done { segments };
            };

            self.state = RelayState::TruncatedContinuing;
            self.depth += 1;
            if self.depth > self.max_continuations {
                let error = ProxyError::ChainLimitExceeded {
                    depth: self.max_continuations,
                };
                return self.fail(error, sink).await;
            }

            tracing::info!(
                depth = self.depth,
                parent_message_id = %point.message_id,
                conversation_id = point.conversation_id.as_deref().unwrap_or(""),
                "Response truncated, continuing generation"
            );
            self.request = self.request.continuation(&point);
            self.truncation = None;

            if sink.is_cancelled() {
                return self.cancel(&sink);
            }

            let dispatched = tokio::select! {
                biased;
                _ = sink.cancelled() => None,
                result = self.open() => Some(result),
            };

            response = match dispatched {
                None => return self.cancel(&sink),
                Some(Ok(response)) => response,
                Some(Err(error)) => return self.fail(error, sink).await,
            };
        }
    }

    async fn stream_segment(
        &mut self,
        response: UpstreamResponse,
        sink: &mut ClientSink,
    ) -> SegmentEnd {
        let mut lines = LineReader::new(response.into_body());

        loop {
            let next = tokio::select! {
                biased;
                _ = sink.cancelled() => return SegmentEnd::Cancelled,
                line = lines.next_line() => line,
            };
            let Some(line) = next else {
                break;
            };

            let event = classify(&line);
            if !event.kind.is_forwarded() {
                continue;
            }

            if event.kind == EventKind::Terminator && self.continuation_pending() {
                tracing::debug!("Holding back terminator, continuation follows");
                continue;
            }

            if let Some(point) = event.truncation {
                tracing::debug!(message_id = %point.message_id, "Truncation signal observed");
                self.truncation = Some(point);
            }

            sink.write_frame(&event.raw);
            if sink.flush().await.is_err() {
                return SegmentEnd::Cancelled;
            }
        }

        if lines.ended_with_error() {
            tracing::warn!(depth = self.depth, "Upstream stream ended with a read error");
        }

        SegmentEnd::Finished
    }

    fn continuation_pending(&self) -> bool {
        self.request.auto_continue && self.truncation.is_some()
    }

    fn continuation_point(&self) -> Option<TruncationPoint> {
        if self.request.auto_continue {
            self.truncation.clone()
        } else {
            None
        }
    }

    fn cancel(&mut self, sink: &ClientSink) -> RelayOutcome {
        self.state = RelayState::Cancelled;
        tracing::info!(
            depth = self.depth,
            frames = sink.frames_written(),
            "Client disconnected, abandoning relay"
        );
        RelayOutcome::Cancelled
    }

    async fn fail(&mut self, error: ProxyError, sink: ClientSink) -> RelayOutcome {
        self.state = RelayState::UpstreamError;
        tracing::error!(
            error_type = error.category(),
            error_message = %error,
            depth = self.depth,
            "Aborting relayed stream"
        );
        sink.abort(error.to_string()).await;
        RelayOutcome::Failed(error)
    }
}
