//! HTTP API Module
//!
//! Provides a REST API for status and queries, and the client the CLI
//! uses to reach it.

mod client;
mod http;

pub use client::ApiClient;
pub use http::{AppState, ErrorResponse, HealthResponse, HttpServer, QueryRequest, QueryResponse, StatusResponse};
