//! HTTP API Server
//!
//! REST API for status and queries. A coordinator node serves its
//! snapshot; a process node also accepts queries through its proxy.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::coordinator::{CoordinatorHandle, CoordinatorSnapshot};
use crate::error::{Error, Result};
use crate::protocol::{QueryResult, Value};
use crate::proxy::{ClientProxy, ProxyStatus};

/// Shared application state
#[derive(Clone, Default)]
pub struct AppState {
    /// Coordinator running in this node, if any
    pub coordinator: Option<CoordinatorHandle>,
    /// Local process proxy, if any
    pub proxy: Option<Arc<ClientProxy>>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Create the router
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/query", post(handle_query))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);

        axum::serve(listener, Self::router(self.state.clone()))
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Query request
#[derive(Debug, Deserialize, Serialize)]
pub struct QueryRequest {
    pub statement: String,
}

/// Query response
#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct QueryResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<u64>,
}

impl From<QueryResult> for QueryResponse {
    fn from(result: QueryResult) -> Self {
        match result {
            QueryResult::Rows { columns, rows } => Self {
                columns,
                rows: rows
                    .into_iter()
                    .map(|row| row.into_iter().map(value_to_json).collect())
                    .collect(),
                changes: None,
            },
            QueryResult::Done { changes } => Self {
                columns: Vec::new(),
                rows: Vec::new(),
                changes: Some(changes),
            },
        }
    }
}

/// Status response
#[derive(Debug, Deserialize, Serialize)]
pub struct StatusResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProxyStatus>,
}

/// Health response
#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub coordinator: bool,
    pub process_id: Option<String>,
}

/// Error response
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Convert a store value to JSON
fn value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(i),
        Value::Real(r) => serde_json::Value::from(r),
        Value::Text(s) => serde_json::Value::String(s),
        Value::Blob(b) => serde_json::Value::from(b),
    }
}

/// Map an error onto a status code: routing failures are retryable (503),
/// rejected statements are not (422)
fn error_response(error: Error) -> Response {
    let status = match &error {
        e if e.is_routing() => StatusCode::SERVICE_UNAVAILABLE,
        Error::Query(_) | Error::Execution(_) | Error::StoreOpenFailed { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            code: error.reason().to_string(),
            error: error.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator_up = state.coordinator.as_ref().map(|c| !c.is_closed());
    let proxy_up = state.proxy.as_ref().map(|p| p.status().connected);

    let healthy = coordinator_up.unwrap_or(true) && proxy_up.unwrap_or(true);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            coordinator: coordinator_up.unwrap_or(false),
            process_id: state.proxy.as_ref().map(|p| p.process_id().to_string()),
        }),
    )
}

async fn handle_status(State(state): State<AppState>) -> Response {
    let coordinator = match &state.coordinator {
        Some(handle) => match handle.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => return error_response(e),
        },
        None => None,
    };

    Json(StatusResponse {
        coordinator,
        process: state.proxy.as_ref().map(|p| p.status()),
    })
    .into_response()
}

async fn handle_query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Response {
    let Some(proxy) = state.proxy.as_ref() else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "This node does not run a process".to_string(),
                code: "no_process".to_string(),
            }),
        )
            .into_response();
    };

    if req.statement.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Statement cannot be empty".to_string(),
                code: "bad_request".to_string(),
            }),
        )
            .into_response();
    }

    match proxy.query(req.statement).await {
        Ok(result) => Json(QueryResponse::from(result)).into_response(),
        Err(e) => error_response(e),
    }
}
