//! REST API server
//!
//! Exposes the assistant pipeline and the token lifecycle over HTTP

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::{Assistant, DEFAULT_CHAT_ID};
use crate::auth::TokenManager;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub chat_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthStatus {
    pub configured: bool,
    pub has_access: bool,
    pub can_refresh: bool,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub assistant: Arc<Assistant>,
    pub tokens: Option<Arc<TokenManager>>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Query Endpoint
/// =============================

async fn run_query(
    State(state): State<ApiState>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let query = req.query.trim();
    if query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Query is empty".into())),
        );
    }

    let chat_id = req
        .chat_id
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_CHAT_ID);
    info!(chat_id, "Received query request");

    let response = state.assistant.handle(query, chat_id).await;
    (StatusCode::OK, Json(ApiResponse::success(response)))
}

/// =============================
/// Auth Endpoints
/// =============================

async fn auth_status(State(state): State<ApiState>) -> Json<ApiResponse> {
    let status = match &state.tokens {
        Some(tokens) => AuthStatus {
            configured: true,
            has_access: tokens.has_access().await,
            can_refresh: tokens.can_refresh().await,
        },
        None => AuthStatus {
            configured: false,
            has_access: false,
            can_refresh: false,
        },
    };
    Json(ApiResponse::success(status))
}

async fn auth_reset(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match &state.tokens {
        Some(tokens) => {
            tokens.reset().await;
            info!("Accounting connection reset");
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({ "disconnected": true }))),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("No accounting connection is configured".into())),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(assistant: Arc<Assistant>, tokens: Option<Arc<TokenManager>>) -> Router {
    let state = ApiState { assistant, tokens };

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/query", post(run_query))
        .route("/api/v1/auth/status", get(auth_status))
        .route("/api/v1/auth/reset", post(auth_reset))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    assistant: Arc<Assistant>,
    tokens: Option<Arc<TokenManager>>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(assistant, tokens);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
