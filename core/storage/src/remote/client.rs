//! Authenticated JSON transport over the API.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use tarotsync_common::{Error, Result};

use super::auth::TokenAuthority;
use super::config::ClientConfig;
use super::http::{decode_response, send_with_timeout, HttpBackend, HttpRequest, HttpResponse, Method};

/// Issues authenticated requests and recovers from expired access tokens.
///
/// An unauthorized response triggers at most one refresh (shared with any
/// concurrent request through the [`TokenAuthority`]) and one replay.
pub struct TransportClient {
    authority: Arc<TokenAuthority>,
    backend: Arc<dyn HttpBackend>,
    config: ClientConfig,
}

impl TransportClient {
    /// Create a client sharing the authority's backend and configuration.
    pub fn new(authority: Arc<TokenAuthority>) -> Self {
        Self {
            backend: authority.backend(),
            config: authority.config().clone(),
            authority,
        }
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    /// Send a request to `path` and decode its JSON response.
    ///
    /// # Errors
    /// - `NetworkUnavailable` on connection failure or timeout
    /// - `AuthenticationRequired` if the request is still unauthorized after
    ///   one refresh, or the refresh itself failed
    /// - `Http` for any other non-success status
    /// - `Decode` if the body is not valid JSON for `T`
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let sent_with = self.authority.access_token();
        let response = self
            .send(method.clone(), path, sent_with.clone(), body.clone())
            .await?;

        if response.status != 401 || is_auth_endpoint(path) {
            return decode_response(response);
        }

        if sent_with.is_none() {
            return Err(Error::AuthenticationRequired("Not signed in".to_string()));
        }

        if self.authority.access_token() == sent_with {
            debug!("{} {} unauthorized; refreshing access token", method, path);
            self.authority.refresh_or_wait().await?;
        } else {
            debug!("{} {} unauthorized with a superseded token; replaying", method, path);
        }

        let retry_with = self
            .authority
            .access_token()
            .ok_or_else(|| Error::AuthenticationRequired("Signed out during request".to_string()))?;

        let response = self.send(method, path, Some(retry_with), body).await?;
        if response.status == 401 {
            return Err(Error::AuthenticationRequired(format!(
                "{} rejected after token refresh",
                path
            )));
        }

        decode_response(response)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::DELETE, path, None).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        bearer: Option<String>,
        body: Option<Value>,
    ) -> Result<HttpResponse> {
        let request = HttpRequest {
            method,
            url: self.config.endpoint(path),
            bearer,
            body,
        };
        send_with_timeout(self.backend.as_ref(), request, self.config.request_timeout()).await
    }
}

/// Auth endpoints report their own 401s; refreshing on them would recurse.
fn is_auth_endpoint(path: &str) -> bool {
    path.starts_with("/auth/")
}
