//! Authenticated HTTP transport.
//!
//! Every outbound request picks up the current access token at send time;
//! a 401 on a fresh request routes through the refresh coordinator exactly
//! once before the caller's future resolves. A 401 on the replayed request
//! is terminal and propagates like any other error status.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::events::SessionEvent;
use crate::session::SessionInner;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Errors produced by the HTTP transport and the refresh protocol.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request could not be sent or the response body could not be read.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Any non-success status outside the refresh protocol, including a 401
    /// on an already-replayed request.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Refresh was impossible or failed; the session has been terminated.
    #[error("session expired: {reason}")]
    SessionExpired { reason: String },

    /// Response body did not match the expected schema.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Per-call request overrides.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestOptions {
    /// Overrides the session-wide request timeout for this call.
    pub timeout: Option<Duration>,
}

/// Verb-based client over the session transport.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<SessionInner>,
}

impl ApiClient {
    pub(crate) fn new(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path, None, RequestOptions::default())
            .await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(
            Method::POST,
            path,
            Some(to_body(body)?),
            RequestOptions::default(),
        )
        .await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(
            Method::PUT,
            path,
            Some(to_body(body)?),
            RequestOptions::default(),
        )
        .await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(
            Method::PATCH,
            path,
            Some(to_body(body)?),
            RequestOptions::default(),
        )
        .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::DELETE, path, None, RequestOptions::default())
            .await
    }

    /// Fully parameterized request with per-call overrides.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let response = self.execute(method, path, body, options).await?;
        decode_json(response).await
    }

    /// Sends a request through the full interception pipeline and returns the
    /// raw successful response.
    ///
    /// The body is held as a JSON value so the request can be replayed after
    /// a token refresh.
    pub(crate) async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Response, ApiError> {
        let response = self.send_once(&method, path, body.as_ref(), options).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return classify(response).await;
        }

        // Fresh 401: refresh once, then replay. The replay result is
        // classified directly, so a second 401 propagates instead of looping.
        self.inner.events.emit(SessionEvent::TokenExpired);
        self.inner.ensure_refreshed().await?;

        let replayed = self.send_once(&method, path, body.as_ref(), options).await?;
        classify(replayed).await
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<Response, ApiError> {
        let url = format!("{}{}", self.inner.config.api_base_url(), path);
        let timeout = options
            .timeout
            .unwrap_or(self.inner.config.request_timeout);
        let mut builder = self
            .inner
            .http
            .request(method.clone(), url)
            .timeout(timeout);

        // No token is not an error; the request goes out unauthenticated.
        if let Some(token) = self.inner.credentials.access_token() {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(ApiError::Transport)
    }
}

fn to_body<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|err| ApiError::Decode(err.to_string()))
}

async fn classify(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.map_err(ApiError::Transport)?;
    Err(ApiError::HttpStatus {
        status,
        body: summarize_error_body(&body),
    })
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let body = response.text().await.map_err(ApiError::Transport)?;
    serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))
}

pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::summarize_error_body;

    #[test]
    fn summarize_prefers_structured_error_fields() {
        assert_eq!(
            summarize_error_body(r#"{"error":"invalid credentials"}"#),
            "invalid credentials"
        );
        assert_eq!(
            summarize_error_body(r#"{"message":"invoice not found"}"#),
            "invoice not found"
        );
        assert_eq!(summarize_error_body(r#"{"reason":"locked"}"#), "locked");
    }

    #[test]
    fn summarize_truncates_unstructured_bodies() {
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }

    #[test]
    fn summarize_passes_short_plain_text_through() {
        assert_eq!(summarize_error_body("Bad Gateway"), "Bad Gateway");
    }
}
