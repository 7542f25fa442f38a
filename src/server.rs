use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{
        header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE},
        Method, StatusCode,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use http_body_util::BodyExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::RelaySettings;
use crate::error::{RelayError, ValidationError};
use crate::message::PromptMessage;
use crate::relay::Relay;
use crate::request::validate_stream_request;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub settings: RelaySettings,
    /// Parent of every session's cancellation token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(relay: Relay, settings: RelaySettings, shutdown: CancellationToken) -> Self {
        Self {
            relay,
            settings,
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(state.settings.cors_origin.clone())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true);

    Router::new()
        .route("/", get(root_handler))
        .route("/openai/stream/", post(stream_handler))
        .route("/openai/stream", post(stream_handler))
        .route("/openai/chat/", get(chat_handler))
        .route("/openai/chat", get(chat_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

async fn root_handler() -> &'static str {
    "stream relay is running"
}

/// `POST /openai/stream/`: relay a streaming completion as NDJSON frames.
pub async fn stream_handler(
    State(state): State<AppState>,
    req: Request,
) -> Result<Response<Body>, RelayError> {
    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!("Failed to read request body: {}", e);
            return Err(ValidationError::Malformed(e.to_string()).into());
        }
    };

    let request = match validate_stream_request(&body_bytes, &state.settings.catalog) {
        Ok(request) => request,
        Err(e) => {
            warn!("⚠️  Rejected stream request: {}", e);
            return Err(e.into());
        }
    };
    info!("📨 Stream request: model={}, messages={}", request.model, request.messages.len());

    let cancel = state.shutdown.child_token();
    let frames = state.relay.start(request, cancel).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive")
        .body(Body::from_stream(frames))
        .map_err(|e| RelayError::Internal(format!("failed to build streaming response: {}", e)))
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    message: Option<String>,
}

/// `GET /openai/chat/?message=`: single-shot completion returned as a JSON string.
pub async fn chat_handler(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
) -> Result<Json<String>, RelayError> {
    let message = match query.message {
        Some(message) if !message.is_empty() => message,
        _ => return Err(ValidationError::MissingField("message").into()),
    };
    let model = state.settings.catalog.default_model.as_str();
    info!("📨 Chat request: model={}", model);

    let text = state
        .relay
        .provider()
        .complete(model, &[PromptMessage::user(message)])
        .await?;
    info!("✅ Chat completion returned {} bytes", text.len());
    Ok(Json(text))
}
