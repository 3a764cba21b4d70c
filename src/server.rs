use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hyper::Server;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::app::ports::QueueClient;
use crate::common::constants::{ANONYMOUS_CALLER, CORRELATION_ID_HEADER, FORWARDED_FOR_HEADER};
use crate::common::error::SubmitError;
use crate::pipeline::ingestion::IngestionGateway;

#[derive(Clone)]
pub struct ServerState {
    pub gateway: Arc<IngestionGateway>,
    pub queue: Arc<dyn QueueClient>,
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "lead-pipeline",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// First `X-Forwarded-For` hop, else anonymous
fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_CALLER)
        .to_string()
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn submit_lead(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let caller = caller_identity(&headers);
    let correlation_id = correlation_id(&headers);

    let result = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => state
            .gateway
            .submit(&caller, Some(correlation_id.clone()), &payload)
            .await
            .map_err(error_response),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "request body is not valid JSON",
                "violations": [{"field": "body", "message": e.to_string()}]
            })),
        )
            .into_response()),
    };

    let mut response = match result {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(response) => response,
    };
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
    }
    response
}

fn error_response(err: SubmitError) -> Response {
    match err {
        SubmitError::Validation(invalid) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": invalid.to_string(),
                "violations": invalid.violations,
            })),
        )
            .into_response(),
        SubmitError::RateLimited(limited) => {
            let retry_after_ms = u64::try_from(limited.retry_after.as_millis()).unwrap_or(u64::MAX);
            let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(json!({
                    "error": "rate limit exceeded",
                    "retryAfterMs": retry_after_ms,
                })),
            )
                .into_response()
        }
        SubmitError::Unavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "lead could not be accepted, try again later"})),
        )
            .into_response(),
    }
}

async fn dead_letters(State(state): State<ServerState>) -> Response {
    match state.queue.dead_letters().await {
        Ok(letters) => {
            let entries: Vec<Value> = letters
                .iter()
                .map(|d| {
                    json!({
                        "messageId": d.message_id,
                        "leadId": d.lead_id(),
                        "reason": d.reason,
                        "deliveryCount": d.delivery_count,
                        "enqueuedAt": d.enqueued_at,
                        "deadLetteredAt": d.dead_lettered_at,
                    })
                })
                .collect();
            Json(json!({"count": entries.len(), "deadLetters": entries})).into_response()
        }
        Err(e) => {
            error!(error = %e, "Listing dead letters failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn prometheus() -> Response {
    match crate::metrics::render() {
        Some(body) => body.into_response(),
        None => (StatusCode::NOT_FOUND, "metrics are disabled").into_response(),
    }
}

/// Create the HTTP router with all routes
pub fn create_server(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/leads", post(submit_lead))
        .route("/admin/dead-letters", get(dead_letters))
        .route("/metrics", get(prometheus))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Serve until `shutdown` resolves
pub async fn start_server<F>(state: ServerState, bind_addr: &str, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address '{bind_addr}': {e}"))?;
    let app = create_server(state);

    info!(%addr, "HTTP server listening");
    Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
