//! The HTTP seam and the one place responses are classified.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::Value;
use tracing::{trace, warn};
use url::Url;

use crate::error::{TransportError, TransportErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query.extend(query);
        self
    }
}

/// Status line and raw body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Performs exactly one HTTP exchange. Retries, timeouts and auth live above.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError>;
}

/// Outcome of one attempt, decided once at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Success(Value),
    /// Worth retrying: timeout, connection failure, 408, 429, 5xx.
    Transient(String),
    /// Never retried: other 4xx, or a 2xx whose body is not JSON.
    Fatal { status: Option<u16>, reason: String },
    /// 401: the bearer token must be refreshed.
    AuthRequired,
}

pub fn classify(result: Result<ApiResponse, TransportError>) -> Classified {
    let response = match result {
        Ok(response) => response,
        Err(err) if err.is_retryable() => return Classified::Transient(err.to_string()),
        Err(err) => {
            return Classified::Fatal {
                status: None,
                reason: err.to_string(),
            };
        }
    };

    match response.status {
        200..=299 => match serde_json::from_str::<Value>(&response.body) {
            Ok(value) => Classified::Success(value),
            Err(e) => Classified::Fatal {
                status: Some(response.status),
                reason: format!("malformed JSON body: {e}"),
            },
        },
        401 => Classified::AuthRequired,
        408 | 429 | 500..=599 => Classified::Transient(format!("HTTP {}", response.status)),
        status => Classified::Fatal {
            status: Some(status),
            reason: truncate(&response.body, 200),
        },
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// [`Transport`] over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestTransport {
    /// Build a transport with its own client. `request_timeout` is a backstop;
    /// the resilient client applies its own per-attempt deadline.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().pool_max_idle_per_host(16);
        if request_timeout > Duration::ZERO {
            builder = builder.timeout(request_timeout);
        }
        let client = builder.build().map_err(TransportError::from)?;
        Self::with_client(base_url, client)
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Result<Self, TransportError> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            TransportError::new(TransportErrorKind::Request, format!("invalid base url: {e}"))
        })?;
        // Url::join drops the last path segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { client, base_url })
    }

    fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::new(TransportErrorKind::Request, e.to_string()))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path)?;
        let mut builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        builder = builder.header(ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(path = %request.path, error = %e, "request failed before a response arrived");
            TransportError::from(e)
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(TransportError::from)?;
        trace!(path = %request.path, status, bytes = body.len(), "response received");

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(500)]
    #[case(502)]
    #[case(503)]
    #[case(429)]
    #[case(408)]
    fn test_retryable_statuses_are_transient(#[case] status: u16) {
        let outcome = classify(Ok(ApiResponse::new(status, "")));
        assert!(matches!(outcome, Classified::Transient(_)));
    }

    #[rstest]
    #[case(400)]
    #[case(403)]
    #[case(404)]
    #[case(422)]
    fn test_other_client_errors_are_fatal(#[case] status: u16) {
        let outcome = classify(Ok(ApiResponse::new(status, "nope")));
        assert_eq!(
            outcome,
            Classified::Fatal {
                status: Some(status),
                reason: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_unauthorized_requires_auth() {
        assert_eq!(
            classify(Ok(ApiResponse::new(401, ""))),
            Classified::AuthRequired
        );
    }

    #[test]
    fn test_success_parses_json() {
        let outcome = classify(Ok(ApiResponse::new(200, r#"{"device_count": 3}"#)));
        assert_eq!(outcome, Classified::Success(json!({"device_count": 3})));
    }

    #[test]
    fn test_malformed_success_body_is_fatal() {
        let outcome = classify(Ok(ApiResponse::new(200, "<html>")));
        assert!(matches!(
            outcome,
            Classified::Fatal {
                status: Some(200),
                ..
            }
        ));
    }

    #[test]
    fn test_transport_errors() {
        let timeout = TransportError::new(TransportErrorKind::Timeout, "deadline");
        assert!(matches!(classify(Err(timeout)), Classified::Transient(_)));

        let bad = TransportError::new(TransportErrorKind::Request, "bad header");
        assert!(matches!(
            classify(Err(bad)),
            Classified::Fatal { status: None, .. }
        ));
    }

    #[test]
    fn test_base_url_keeps_path_prefix() {
        let transport = ReqwestTransport::new("https://fleet.example/api/v1", Duration::ZERO).unwrap();
        let url = transport.url_for("/device_detail/abc").unwrap();
        assert_eq!(url.as_str(), "https://fleet.example/api/v1/device_detail/abc");
    }

    #[test]
    fn test_truncate_long_bodies() {
        let body = "x".repeat(300);
        let truncated = truncate(&body, 200);
        assert_eq!(truncated.len(), 203);
        assert_eq!(truncate("short", 200), "short");
    }
}
