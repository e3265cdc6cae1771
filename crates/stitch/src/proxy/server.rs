//! HTTP gateway server
//!
//! Exposes the client-facing conversation endpoint. Each request is decoded,
//! given a challenge token when its model needs one, and dispatched upstream.
//! Once the upstream accepts it, the response is a stream that a background
//! relay task keeps feeding until the whole chain of continuations is done.

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Response, header},
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{Result, StitchError};
use crate::relay::{
    Action, ArkoseTokenClient, ChallengeTokenSource, ClientSink, ConversationRequest,
    HttpUpstream, RelayOutcome, RelaySession, UpstreamClient, bearer, build_http_client,
};

use super::ProxyError;

/// Client-facing path of the conversation endpoint
pub const CONVERSATION_ROUTE: &str = "/chatgpt/conversation";

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Gateway configuration
    pub config: Config,
    /// Dispatches conversation turns upstream
    pub upstream: Arc<dyn UpstreamClient>,
    /// Supplies challenge tokens for models that need them
    pub challenge: Arc<dyn ChallengeTokenSource>,
}

/// The main gateway server
pub struct ProxyServer {
    config: Config,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start the server and listen for requests until a shutdown signal
    pub async fn serve(&self) -> Result<()> {
        let client = build_http_client(&self.config.upstream)?;
        let upstream = HttpUpstream::new(client.clone(), &self.config.upstream)?;
        let challenge = ArkoseTokenClient::new(
            client,
            self.config.challenge.clone(),
            self.config.upstream.user_agent.clone(),
        );

        tracing::info!("Upstream conversation endpoint: {}", upstream.url());
        if self.config.challenge.enabled {
            tracing::info!(
                "Challenge tokens enabled for {} models",
                self.config.challenge.models.len()
            );
        } else {
            tracing::info!("Challenge tokens disabled");
        }
        if self.config.upstream.proxy_url.is_some() {
            tracing::info!("Routing upstream traffic through configured proxy");
        }

        let app_state = Arc::new(AppState {
            config: self.config.clone(),
            upstream: Arc::new(upstream),
            challenge: Arc::new(challenge),
        });

        let app = create_router(app_state);
        let addr = self.config.server.socket_addr()?;

        tracing::info!("Starting gateway on {addr}");

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StitchError::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| StitchError::Proxy(format!("Server error: {e}")))?;

        tracing::info!("Gateway shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/healthCheck", get(health_handler))
        .route(CONVERSATION_ROUTE, post(conversation_handler));

    if state.config.server.cors_enabled {
        router = router.layer(cors_layer());
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Browser clients call the gateway cross-origin with their own token
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Health check endpoint - returns JSON status
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Relay one conversation request.
///
/// Errors before the upstream accepts the request are returned as JSON with
/// a status. After that the response is always a 200 event stream.
async fn conversation_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    match start_relay(&state, &headers, &body).await {
        Ok(response) => response,
        Err(e) => {
            e.log();
            e.into_response()
        }
    }
}

async fn start_relay(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> std::result::Result<Response<Body>, ProxyError> {
    let authorization = caller_authorization(headers)?;
    let mut request = ConversationRequest::from_slice(body)?;

    tracing::info!(
        model = %request.model,
        action = request.action.as_str(),
        auto_continue = request.auto_continue,
        "Conversation request received"
    );

    if request.action == Action::Next
        && request.arkose_token.is_none()
        && state.config.challenge.requires_token(&request.model)
    {
        let token = state.challenge.fetch(&request.model).await?;
        request.arkose_token = Some(token);
    }

    let mut session = RelaySession::new(
        state.upstream.clone(),
        authorization,
        request,
        state.config.relay.max_continuations,
    );
    let first = session.open().await?;

    let (sink, response) = ClientSink::channel(state.config.relay.channel_capacity);

    tokio::spawn(async move {
        match session.run(first, sink).await {
            RelayOutcome::Done { segments } => {
                tracing::debug!(segments, depth = session.depth(), "Relay finished")
            }
            RelayOutcome::Cancelled => {
                tracing::debug!(depth = session.depth(), "Relay cancelled by client")
            }
            RelayOutcome::Failed(e) => {
                tracing::warn!(error_type = e.category(), "Relay aborted mid-stream")
            }
        }
    });

    Ok(response)
}

/// The caller's access token as an upstream `Authorization` value
fn caller_authorization(headers: &HeaderMap) -> std::result::Result<String, ProxyError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ProxyError::Unauthorized("Missing Authorization header".to_string()))?;
    let token = value
        .to_str()
        .map_err(|_| ProxyError::Unauthorized("Unreadable Authorization header".to_string()))?;

    let authorization = bearer(token);
    if authorization.trim_start_matches("Bearer").trim().is_empty() {
        return Err(ProxyError::Unauthorized(
            "Empty Authorization header".to_string(),
        ));
    }
    Ok(authorization)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::EVENT_STREAM_CONTENT_TYPE;
    use crate::testing::{ScriptedUpstream, StaticChallenge, done_frame, message_frame};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct Harness {
        upstream: Arc<ScriptedUpstream>,
        challenge: Arc<StaticChallenge>,
        app: Router,
    }

    fn harness_with(challenge: StaticChallenge) -> Harness {
        let upstream = Arc::new(ScriptedUpstream::new());
        let challenge = Arc::new(challenge);
        let state = Arc::new(AppState {
            config: Config::default(),
            upstream: upstream.clone(),
            challenge: challenge.clone(),
        });
        Harness {
            upstream,
            challenge,
            app: create_router(state),
        }
    }

    fn harness() -> Harness {
        harness_with(StaticChallenge::new("fetched-token"))
    }

    fn conversation(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(CONVERSATION_ROUTE)
            .header("content-type", "application/json")
            .header("authorization", "secret-token")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let h = harness();

        let response = h
            .app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn test_health_check_alias() {
        let h = harness();

        let response = h
            .app
            .oneshot(Request::builder().uri("/healthCheck").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn test_cors_preflight_is_answered() {
        let h = harness();

        let response = h
            .app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri(CONVERSATION_ROUTE)
                    .header("origin", "https://chat.example.com")
                    .header("access-control-request-method", "POST")
                    .header("access-control-request-headers", "authorization,content-type")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
        assert!(
            response
                .headers()
                .contains_key("access-control-allow-methods")
        );
        assert_eq!(h.upstream.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_cors_headers_on_relayed_response() {
        let h = harness();
        h.upstream.push_frames(&[done_frame()]);

        let mut request = conversation(serde_json::json!({
            "model": "text-davinci-002-render-sha",
            "messages": [{"content": "hello"}],
        }));
        request
            .headers_mut()
            .insert("origin", "https://chat.example.com".parse().unwrap());

        let response = h.app.oneshot(request).await.unwrap();

        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_can_be_disabled() {
        let mut config = Config::default();
        config.server.cors_enabled = false;
        let app = create_router(Arc::new(AppState {
            config,
            upstream: Arc::new(ScriptedUpstream::new()),
            challenge: Arc::new(StaticChallenge::new("t")),
        }));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "https://chat.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(
            !response
                .headers()
                .contains_key("access-control-allow-origin")
        );
    }

    #[tokio::test]
    async fn test_missing_authorization_is_rejected_before_dispatch() {
        let h = harness();
        h.upstream.push_frames(&[done_frame()]);

        let response = h
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(CONVERSATION_ROUTE)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "model": "gpt-4",
                            "messages": [{"content": "hello"}],
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(response).await.contains("invalid_request_error"));
        assert_eq!(h.upstream.dispatch_count(), 0);
        assert_eq!(h.challenge.calls(), 0);
    }

    #[tokio::test]
    async fn test_blank_or_unreadable_authorization_is_rejected() {
        for value in [
            axum::http::HeaderValue::from_static("   "),
            axum::http::HeaderValue::from_static("Bearer "),
            axum::http::HeaderValue::from_bytes(b"tok\xffen").unwrap(),
        ] {
            let h = harness();
            let mut request = conversation(serde_json::json!({
                "model": "text-davinci-002-render-sha",
                "messages": [{"content": "hello"}],
            }));
            request.headers_mut().insert(header::AUTHORIZATION, value);

            let response = h.app.oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(h.upstream.dispatch_count(), 0);
        }
    }

    #[test]
    fn test_caller_authorization_is_normalized() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "abc".parse().unwrap());
        assert_eq!(caller_authorization(&headers).unwrap(), "Bearer abc");

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(caller_authorization(&headers).unwrap(), "Bearer abc");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let h = harness();

        let response = h
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(CONVERSATION_ROUTE)
                    .header("authorization", "secret-token")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("invalid_request_error"));
        assert_eq!(h.upstream.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_is_relayed_with_normalized_credentials() {
        let h = harness();
        h.upstream.push_frames(&[
            message_frame("m1", "c1", Some("stop"), "finished_successfully", "hi"),
            done_frame(),
        ]);

        let response = h
            .app
            .oneshot(conversation(serde_json::json!({
                "model": "text-davinci-002-render-sha",
                "messages": [{"content": "hello"}],
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            EVENT_STREAM_CONTENT_TYPE
        );
        let body = body_string(response).await;
        assert!(body.ends_with("data: [DONE]\n\n"));

        assert_eq!(h.upstream.authorizations(), vec!["Bearer secret-token"]);
        assert_eq!(h.challenge.calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_rejection_passes_through() {
        let h = harness();
        h.upstream
            .push_status(StatusCode::TOO_MANY_REQUESTS, r#"{"detail":"slow down"}"#);

        let response = h
            .app
            .oneshot(conversation(serde_json::json!({
                "model": "text-davinci-002-render-sha",
                "messages": [{"content": "hello"}],
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(response).await, r#"{"detail":"slow down"}"#);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let h = harness();
        h.upstream
            .push_failure(ProxyError::Network("connection refused".to_string()));

        let response = h
            .app
            .oneshot(conversation(serde_json::json!({
                "model": "text-davinci-002-render-sha",
                "messages": [{"content": "hello"}],
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_challenge_token_fetched_for_gated_model() {
        let h = harness();
        h.upstream.push_frames(&[done_frame()]);

        let response = h
            .app
            .oneshot(conversation(serde_json::json!({
                "model": "gpt-4",
                "messages": [{"content": "hello"}],
            })))
            .await
            .unwrap();
        body_string(response).await;

        assert_eq!(h.challenge.calls(), 1);
        assert_eq!(
            h.upstream.requests()[0].arkose_token.as_deref(),
            Some("fetched-token")
        );
    }

    #[tokio::test]
    async fn test_caller_token_is_kept() {
        let h = harness();
        h.upstream.push_frames(&[done_frame()]);

        let response = h
            .app
            .oneshot(conversation(serde_json::json!({
                "model": "gpt-4",
                "arkose_token": "caller-token",
                "messages": [{"content": "hello"}],
            })))
            .await
            .unwrap();
        body_string(response).await;

        assert_eq!(h.challenge.calls(), 0);
        assert_eq!(
            h.upstream.requests()[0].arkose_token.as_deref(),
            Some("caller-token")
        );
    }

    #[tokio::test]
    async fn test_challenge_failure_is_bad_gateway() {
        let h = harness_with(StaticChallenge::failing());

        let response = h
            .app
            .oneshot(conversation(serde_json::json!({
                "model": "gpt-4",
                "messages": [{"content": "hello"}],
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains("challenge_error"));
        assert_eq!(h.upstream.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let h = harness();

        let response = h
            .app
            .oneshot(Request::builder().uri("/backend-api/conversation").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
