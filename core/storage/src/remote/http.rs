//! HTTP backend seam between the transport client and the network.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub use reqwest::Method;

use super::wire::ErrorBody;
use tarotsync_common::{Error, Result};

/// One outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Bearer token for the `Authorization` header.
    pub bearer: Option<String>,
    /// JSON body.
    pub body: Option<serde_json::Value>,
}

/// Raw HTTP response; the body is decoded by the transport client.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends HTTP requests.
///
/// Implementations report connection failures as `NetworkUnavailable` and
/// return every received response, whatever its status.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production backend built on `reqwest`.
pub struct ReqwestBackend {
    http: Client,
}

impl ReqwestBackend {
    /// Create a backend sending `user_agent` with every request.
    pub fn new(user_agent: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .header(header::ACCEPT, "application/json");

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            Error::NetworkUnavailable(format!("{} {} failed: {}", request.method, request.url, e))
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            Error::NetworkUnavailable(format!("Failed to read response body: {}", e))
        })?;

        Ok(HttpResponse { status, body })
    }
}

/// Send a request, failing with `NetworkUnavailable` if it outlives `timeout`.
pub(crate) async fn send_with_timeout(
    backend: &dyn HttpBackend,
    request: HttpRequest,
    timeout: Duration,
) -> Result<HttpResponse> {
    let description = format!("{} {}", request.method, request.url);

    match tokio::time::timeout(timeout, backend.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(Error::NetworkUnavailable(format!(
            "{} timed out after {:?}",
            description, timeout
        ))),
    }
}

/// Human-readable reason for a failed response.
pub(crate) fn error_message(response: &HttpResponse) -> String {
    serde_json::from_str::<ErrorBody>(&response.body)
        .ok()
        .and_then(|body| body.error.or(body.message))
        .unwrap_or_else(|| format!("HTTP {}", response.status))
}

/// Decode a JSON response, turning non-success statuses into `Http` errors.
pub(crate) fn decode_response<T: DeserializeOwned>(response: HttpResponse) -> Result<T> {
    if !response.is_success() {
        return Err(Error::Http {
            status: response.status,
            message: error_message(&response),
        });
    }

    let body = if response.body.trim().is_empty() {
        "null"
    } else {
        response.body.as_str()
    };

    serde_json::from_str(body).map_err(|e| Error::Decode(format!("Malformed response: {}", e)))
}
