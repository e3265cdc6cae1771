//! Outbound conversation requests
//!
//! `UpstreamClient` is the seam between the relay and the network. The
//! production implementation wraps one long-lived `reqwest::Client` that is
//! shared by every session; only the per-request builder ever carries the
//! caller's credentials.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use url::Url;

use super::request::ConversationRequest;
use crate::config::UpstreamConfig;
use crate::error::{Result, StitchError};
use crate::proxy::ProxyError;

/// Largest upstream error body read back for the client
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

/// Status and unread body of an upstream response
pub struct UpstreamResponse {
    pub status: StatusCode,
    body: ByteStream,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, body: ByteStream) -> Self {
        Self { status, body }
    }

    pub fn into_body(self) -> ByteStream {
        self.body
    }

    /// Read the body into memory, stopping at `limit` bytes or the first read error
    pub async fn collect_body(self, limit: usize) -> Vec<u8> {
        let mut body = self.body;
        let mut collected = Vec::new();
        while let Some(Ok(chunk)) = body.next().await {
            let room = limit.saturating_sub(collected.len());
            collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if collected.len() >= limit {
                break;
            }
        }
        collected
    }

    /// Turn a non-success response into the error the client should see
    pub async fn into_rejection(self) -> ProxyError {
        let status = self.status;
        let body = self.collect_body(MAX_ERROR_BODY_BYTES).await;
        ProxyError::upstream(status, &body)
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Dispatches one conversation turn upstream
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send `request` with the given `Authorization` value.
    ///
    /// Any HTTP status is returned as a response; only transport failures are errors.
    async fn send(
        &self,
        request: &ConversationRequest,
        authorization: &str,
    ) -> std::result::Result<UpstreamResponse, ProxyError>;
}

/// Normalize a caller token into an `Authorization` header value
pub fn bearer(token: &str) -> String {
    let token = token.trim();
    if token.starts_with("Bearer") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

/// Build the shared HTTP client from configuration
pub fn build_http_client(config: &UpstreamConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));

    if let Some(ref proxy_url) = config.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| StitchError::Config(format!("Invalid proxy URL '{proxy_url}': {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| StitchError::Proxy(format!("Failed to create HTTP client: {e}")))
}

/// `UpstreamClient` over HTTP
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: Url,
    user_agent: String,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Result<Self> {
        Ok(Self {
            client,
            url: config.conversation_url()?,
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn send(
        &self,
        request: &ConversationRequest,
        authorization: &str,
    ) -> std::result::Result<UpstreamResponse, ProxyError> {
        tracing::debug!(
            action = request.action.as_str(),
            model = %request.model,
            parent_message_id = %request.parent_message_id,
            "Dispatching conversation request to {}",
            self.url
        );

        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(network_error)?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        Ok(UpstreamResponse::new(status, body))
    }
}

fn network_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::Network(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProxyError::Network(format!("Failed to connect to upstream: {e}"))
    } else {
        ProxyError::Network(format!("Request failed: {e}"))
    }
}
