//! Test utilities for stitch - scripted upstreams and frame builders
//!
//! These let relay tests run without a network:
//! - `ScriptedUpstream` answers each dispatch with the next queued response
//! - `StaticChallenge` hands out a fixed challenge token
//! - frame helpers build upstream SSE lines in the wire format

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::proxy::ProxyError;
use crate::relay::{
    ByteStream, ChallengeTokenSource, ConversationRequest, UpstreamClient, UpstreamResponse,
};

/// Sender half of a response body fed by the test itself
pub type BodyFeed = mpsc::Sender<Result<Bytes, std::io::Error>>;

enum Scripted {
    Response(StatusCode, ByteStream),
    Failure(ProxyError),
}

/// An `UpstreamClient` that replays queued responses in order.
///
/// Every dispatch is recorded, so tests can assert on what the relay sent.
#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Scripted>>,
    sent: Mutex<Vec<(ConversationRequest, String)>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: Scripted) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(entry);
        }
    }

    /// Queue a 200 response that delivers each frame as its own chunk
    pub fn push_frames(&self, frames: &[String]) {
        let chunks: Vec<Result<Bytes, std::io::Error>> = frames
            .iter()
            .map(|f| Ok(Bytes::from(f.clone())))
            .collect();
        self.push(Scripted::Response(
            StatusCode::OK,
            stream::iter(chunks).boxed(),
        ));
    }

    /// Queue a 200 response with a single-chunk body
    pub fn push_body(&self, body: &str) {
        self.push_chunks(vec![Ok(Bytes::from(body.to_string()))]);
    }

    /// Queue a 200 response with exactly these chunks, read errors included
    pub fn push_chunks(&self, chunks: Vec<Result<Bytes, std::io::Error>>) {
        self.push(Scripted::Response(
            StatusCode::OK,
            stream::iter(chunks).boxed(),
        ));
    }

    /// Queue a rejection with the given status and body
    pub fn push_status(&self, status: StatusCode, body: &str) {
        let chunk: Result<Bytes, std::io::Error> = Ok(Bytes::from(body.to_string()));
        self.push(Scripted::Response(status, stream::iter(vec![chunk]).boxed()));
    }

    /// Queue a 200 response whose body is fed through the returned sender
    pub fn push_channel(&self) -> BodyFeed {
        let (tx, rx) = mpsc::channel(16);
        self.push(Scripted::Response(
            StatusCode::OK,
            ReceiverStream::new(rx).boxed(),
        ));
        tx
    }

    /// Queue a transport failure
    pub fn push_failure(&self, error: ProxyError) {
        self.push(Scripted::Failure(error));
    }

    /// Requests dispatched so far, in order
    pub fn requests(&self) -> Vec<ConversationRequest> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// `Authorization` values dispatched so far, in order
    pub fn authorizations(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|(_, a)| a.clone()).collect())
            .unwrap_or_default()
    }

    pub fn dispatch_count(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn send(
        &self,
        request: &ConversationRequest,
        authorization: &str,
    ) -> Result<UpstreamResponse, ProxyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((request.clone(), authorization.to_string()));
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Response(status, body)) => Ok(UpstreamResponse::new(status, body)),
            Some(Scripted::Failure(error)) => Err(error),
            None => Err(ProxyError::Network("No scripted response left".to_string())),
        }
    }
}

/// A challenge source with a fixed answer
#[derive(Default)]
pub struct StaticChallenge {
    token: Option<String>,
    calls: AtomicUsize,
}

impl StaticChallenge {
    pub fn new(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A source whose every fetch fails
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeTokenSource for StaticChallenge {
    async fn fetch(&self, _model: &str) -> Result<String, ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token
            .clone()
            .ok_or_else(|| ProxyError::Challenge("Challenge endpoint unavailable".to_string()))
    }
}

/// One upstream content frame, terminated by a blank line.
///
/// `finish` sets `message.metadata.finish_details.type`; `None` leaves it out.
pub fn message_frame(
    message_id: &str,
    conversation_id: &str,
    finish: Option<&str>,
    status: &str,
    text: &str,
) -> String {
    let metadata = match finish {
        Some(kind) => serde_json::json!({
            "finish_details": {"type": kind, "stop": "<|im_end|>"},
            "model_slug": "gpt-4",
        }),
        None => serde_json::json!({"model_slug": "gpt-4"}),
    };

    let frame = serde_json::json!({
        "message": {
            "id": message_id,
            "author": {"role": "assistant"},
            "content": {"content_type": "text", "parts": [text]},
            "status": status,
            "end_turn": finish.map(|kind| kind != "max_tokens"),
            "metadata": metadata,
        },
        "conversation_id": conversation_id,
        "error": null,
    });

    format!("data: {frame}\n\n")
}

/// The end-of-stream terminator frame
pub fn done_frame() -> String {
    "data: [DONE]\n\n".to_string()
}
