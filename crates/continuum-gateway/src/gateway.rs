//! HTTP façade
//!
//! OpenAI-compatible endpoints in front of the orchestrator. Streaming
//! completions are rendered as server-sent `chat.completion.chunk` events
//! followed by `data: [DONE]`; non-streaming ones are aggregated into a single
//! `chat.completion` object.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::orchestrator::Orchestrator;
use crate::types::{
    ChatMessage, ChunkError, CompletionChunk, CompletionRequest, FinishReason,
    GenerationSettings, Usage,
};
use crate::{GatewayError, Result};

/// Gateway state shared across handlers
#[derive(Clone)]
pub struct GatewayState {
    pub config: GatewayConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: DateTime<Utc>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            started_at: Utc::now(),
            shutdown_tx,
        }
    }
}

/// HTTP gateway
pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let state = Arc::new(GatewayState::new(config, orchestrator));
        Self { state }
    }

    /// Get gateway state
    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Build the Axum router
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(Self::handle_health))
            .route("/status", get(Self::handle_status))
            .route("/v1/models", get(Self::handle_models))
            .route("/v1/chat/completions", post(Self::handle_chat_completions))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until [`Gateway::shutdown`].
    pub async fn start(&self) -> Result<()> {
        let addr = self.state.config.http_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Continuum HTTP gateway listening on {}", addr);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(())
    }

    /// Shutdown the gateway
    pub fn shutdown(&self) {
        let _ = self.state.shutdown_tx.send(());
        tracing::info!("Gateway shutdown initiated");
    }

    // HTTP handlers

    async fn handle_health() -> impl IntoResponse {
        Json(json!({
            "status": "healthy",
            "version": crate::VERSION
        }))
    }

    /// Gateway status as seen by the calling identity.
    async fn handle_status(
        State(state): State<Arc<GatewayState>>,
        headers: HeaderMap,
    ) -> Response {
        let orchestrator = &state.orchestrator;
        let identity = match bearer_token(&headers).and_then(|t| orchestrator.authenticate(t)) {
            Ok(identity) => identity,
            Err(e) => return e.into_response(),
        };

        let uptime = Utc::now().signed_duration_since(state.started_at);
        let (used, limit) = orchestrator.limiter().status(&identity);

        Json(json!({
            "version": crate::VERSION,
            "started_at": state.started_at.to_rfc3339(),
            "uptime_secs": uptime.num_seconds(),
            "identity": {
                "name": identity.name,
                "permissions": identity.permissions.to_list(),
                "rate_limit": {
                    "limit": limit,
                    "window_secs": identity.quota.window.as_secs(),
                    "used": used,
                },
            },
            "models": orchestrator.visible_models(&identity),
            "wire": {
                "enabled": state.config.wire.enabled,
                "port": state.config.wire.port,
            }
        }))
        .into_response()
    }

    async fn handle_models(
        State(state): State<Arc<GatewayState>>,
        headers: HeaderMap,
    ) -> Response {
        let identity = match bearer_token(&headers).and_then(|t| state.orchestrator.authenticate(t)) {
            Ok(identity) => identity,
            Err(e) => return e.into_response(),
        };

        let created = state.started_at.timestamp();
        let router = state.orchestrator.router();
        let data: Vec<Value> = state
            .orchestrator
            .visible_models(&identity)
            .into_iter()
            .map(|id| {
                json!({
                    "id": id,
                    "object": "model",
                    "created": created,
                    "owned_by": router.binding(&id).unwrap_or("unknown"),
                })
            })
            .collect();

        Json(json!({ "object": "list", "data": data })).into_response()
    }

    async fn handle_chat_completions(
        State(state): State<Arc<GatewayState>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let result = async {
            let token = bearer_token(&headers)?;
            let body: ChatCompletionBody = serde_json::from_slice(&body)
                .map_err(|e| GatewayError::InvalidRequest(format!("malformed body: {}", e)))?;
            let request = body.into_request();
            let model = request.model.clone();
            let streaming = request.stream;
            let chunks = state.orchestrator.complete(token, request).await?;
            Ok::<_, GatewayError>((model, streaming, chunks))
        }
        .await;

        let (model, streaming, chunks) = match result {
            Ok(parts) => parts,
            Err(e) => return e.into_response(),
        };

        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        let created = Utc::now().timestamp();

        if streaming {
            let events = chunks
                .map(move |chunk| {
                    let event = chunk_event(&id, created, &model, &chunk);
                    Ok::<_, Infallible>(Event::default().data(event.to_string()))
                })
                .chain(stream::once(async { Ok(Event::default().data("[DONE]")) }));
            return Sse::new(events).keep_alive(KeepAlive::default()).into_response();
        }

        let chunks: Vec<CompletionChunk> = chunks.collect().await;
        aggregate(&id, created, &model, chunks)
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(GatewayError::Unauthorized)
}

/// OpenAI `stop` accepts one string or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StopSequences {
    One(String),
    Many(Vec<String>),
}

/// OpenAI chat completion request body
#[derive(Debug, Deserialize)]
struct ChatCompletionBody {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    top_p: Option<f64>,
    frequency_penalty: Option<f64>,
    presence_penalty: Option<f64>,
    stop: Option<StopSequences>,
}

impl ChatCompletionBody {
    fn into_request(self) -> CompletionRequest {
        let stop = match self.stop {
            None => Vec::new(),
            Some(StopSequences::One(s)) => vec![s],
            Some(StopSequences::Many(v)) => v,
        };
        CompletionRequest::new(self.model, self.messages)
            .with_stream(self.stream)
            .with_settings(GenerationSettings {
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                top_p: self.top_p,
                frequency_penalty: self.frequency_penalty,
                presence_penalty: self.presence_penalty,
                stop,
            })
    }
}

fn chunk_event(id: &str, created: i64, model: &str, chunk: &CompletionChunk) -> Value {
    let delta = if chunk.delta.is_empty() {
        json!({})
    } else {
        json!({ "content": chunk.delta })
    };
    let mut event = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": chunk.finish_reason.map(|r| r.as_str()),
        }],
    });
    if let Some(usage) = chunk.usage {
        event["usage"] = json!(usage);
    }
    if let Some(error) = &chunk.error {
        event["error"] = json!({ "code": error.code, "message": error.message });
    }
    event
}

fn aggregate(id: &str, created: i64, model: &str, chunks: Vec<CompletionChunk>) -> Response {
    let mut content = String::new();
    let mut finish_reason = FinishReason::Stop;
    let mut usage: Option<Usage> = None;

    for chunk in chunks {
        if let Some(error) = chunk.error {
            return chunk_error_response(&error);
        }
        content.push_str(&chunk.delta);
        if let Some(reason) = chunk.finish_reason {
            finish_reason = reason;
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    Json(json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish_reason.as_str(),
        }],
        "usage": usage.unwrap_or_default(),
    }))
    .into_response()
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message,
                "type": code.to_ascii_lowercase(),
                "code": code,
            }
        })),
    )
        .into_response()
}

/// A stream that already started and then failed: the provider broke.
fn chunk_error_response(error: &ChunkError) -> Response {
    error_response(StatusCode::BAD_GATEWAY, &error.code, &error.message)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        }

        let mut response = error_response(status, self.code(), &self.to_string());
        if let Some(secs) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
