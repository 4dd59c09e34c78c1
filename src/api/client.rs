//! HTTP API Client
//!
//! Used by the CLI to talk to a running node.

use std::time::Duration;

use super::http::{ErrorResponse, QueryRequest, QueryResponse, StatusResponse};
use crate::error::{Error, Result};

/// Client for a node's HTTP API
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a client for `address` (host:port or a full URL)
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    /// Fetch `/status`
    pub async fn status(&self) -> Result<StatusResponse> {
        let response = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        Self::decode(response).await
    }

    /// Run a statement through the node's process
    pub async fn query(&self, statement: &str) -> Result<QueryResponse> {
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&QueryRequest {
                statement: statement.to_string(),
            })
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        Self::decode(response).await
    }

    fn connection_error(&self, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::ConnectionTimeout(self.base_url.clone())
        } else {
            Error::ConnectionFailed {
                address: self.base_url.clone(),
                reason: error.to_string(),
            }
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::Network(format!("Invalid response body: {}", e)));
        }

        match response.json::<ErrorResponse>().await {
            Ok(body) => Err(Error::Network(format!("{} ({}): {}", status, body.code, body.error))),
            Err(_) => Err(Error::Network(format!("Request failed with {}", status))),
        }
    }
}
