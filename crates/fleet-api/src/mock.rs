//! In-memory [`Transport`] for tests.
//!
//! Routes are matched on the exact path first, then on the longest matching
//! prefix; anything else answers 404. Every call is recorded with the bearer
//! it carried and the (tokio) instant it was issued, and the peak number of
//! concurrently outstanding calls is tracked.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{ApiRequest, ApiResponse, Method, Transport};

/// A request as seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub bearer: Option<String>,
    pub at: Instant,
}

impl RecordedCall {
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Integer query parameter, e.g. `offset`.
    pub fn query_u64(&self, key: &str) -> Option<u64> {
        self.query_param(key).and_then(|v| v.parse().ok())
    }
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Response(ApiResponse),
    Error(TransportError),
}

impl MockReply {
    pub fn json(status: u16, body: Value) -> Self {
        Self::Response(ApiResponse::new(status, body.to_string()))
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::Response(ApiResponse::new(status, body))
    }

    pub fn status(status: u16) -> Self {
        Self::text(status, "")
    }

    pub fn error(kind: TransportErrorKind) -> Self {
        Self::Error(TransportError::new(kind, "simulated transport failure"))
    }
}

type Handler = Arc<dyn Fn(&RecordedCall) -> MockReply + Send + Sync>;

#[derive(Default)]
pub struct MockTransport {
    exact: RwLock<HashMap<String, Handler>>,
    prefixes: RwLock<Vec<(String, Handler)>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(&self, path: &str, handler: F)
    where
        F: Fn(&RecordedCall) -> MockReply + Send + Sync + 'static,
    {
        self.exact.write().insert(path.to_string(), Arc::new(handler));
    }

    pub fn route_prefix<F>(&self, prefix: &str, handler: F)
    where
        F: Fn(&RecordedCall) -> MockReply + Send + Sync + 'static,
    {
        let mut prefixes = self.prefixes.write();
        prefixes.retain(|(p, _)| p != prefix);
        prefixes.push((prefix.to_string(), Arc::new(handler)));
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Delay applied to every reply, observed by the caller's timeout.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.path == path).count()
    }

    pub fn calls_with_prefix(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.path.starts_with(prefix))
            .count()
    }

    pub fn login_calls(&self) -> usize {
        self.calls_to(crate::auth::LOGIN_PATH)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn handler_for(&self, path: &str) -> Option<Handler> {
        if let Some(handler) = self.exact.read().get(path) {
            return Some(handler.clone());
        }
        self.prefixes
            .read()
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let call = RecordedCall {
            method: request.method,
            path: request.path.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            bearer: bearer.map(str::to_string),
            at: Instant::now(),
        };
        self.calls.lock().push(call.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.handler_for(&request.path) {
            Some(handler) => match handler(&call) {
                MockReply::Response(response) => Ok(response),
                MockReply::Error(err) => Err(err),
            },
            None => Ok(ApiResponse::new(404, "no route")),
        }
    }
}
