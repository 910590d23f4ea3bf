//! Bounded-concurrency fetch with timeout, backoff and re-authentication.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::AuthState;
use crate::error::FetchError;
use crate::rate_limiter::WindowRateLimiter;
use crate::retry::RetryPolicy;
use crate::transport::{ApiRequest, Classified, Transport, classify};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ceiling on HTTP calls in flight across every caller of this client.
    pub max_concurrent_calls: usize,
    /// Wall-clock limit for one attempt. Exceeding it is a transient failure.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Running counters, readable while the client is in use.
#[derive(Debug, Default)]
pub struct ClientStats {
    requests: AtomicU64,
    retries: AtomicU64,
    reauths: AtomicU64,
    failures: AtomicU64,
}

impl ClientStats {
    /// HTTP attempts actually issued.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Backoff sleeps taken after transient failures.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn reauths(&self) -> u64 {
        self.reauths.load(Ordering::Relaxed)
    }

    /// Logical fetches that ended in an error other than cancellation.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    auth: Arc<AuthState>,
    semaphore: Arc<Semaphore>,
    config: ClientConfig,
    cancel: CancellationToken,
    stats: ClientStats,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn Transport>, auth: Arc<AuthState>, config: ClientConfig) -> Self {
        let permits = config.max_concurrent_calls.max(1);
        Self {
            transport,
            auth,
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
            cancel: CancellationToken::new(),
            stats: ClientStats::default(),
        }
    }

    /// Stop issuing new calls once `token` is cancelled. Calls already on the
    /// wire are allowed to finish or time out.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn auth(&self) -> &Arc<AuthState> {
        &self.auth
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Free concurrency slots right now.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Fetch one JSON document, retrying per the configured policy.
    pub async fn fetch(&self, request: &ApiRequest) -> Result<Value, FetchError> {
        self.execute(request, None).await
    }

    /// Like [`fetch`](Self::fetch), but every attempt, retries included, is
    /// also admitted by `limiter` immediately before it is sent.
    pub async fn fetch_limited(
        &self,
        request: &ApiRequest,
        limiter: &WindowRateLimiter,
    ) -> Result<Value, FetchError> {
        self.execute(request, Some(limiter)).await
    }

    async fn execute(
        &self,
        request: &ApiRequest,
        limiter: Option<&WindowRateLimiter>,
    ) -> Result<Value, FetchError> {
        let result = self.attempt_loop(request, limiter).await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %request.path, error = %e, "fetch failed");
            }
        }
        result
    }

    async fn attempt_loop(
        &self,
        request: &ApiRequest,
        limiter: Option<&WindowRateLimiter>,
    ) -> Result<Value, FetchError> {
        let mut failures = 0u32;
        let mut reauthenticated = false;

        loop {
            let permit = self.acquire_slot(limiter).await?;
            let (token, generation) = self.auth.current();
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            // In-flight calls are not raced against cancellation.
            let outcome = match tokio::time::timeout(
                self.config.request_timeout,
                self.transport.send(request, token.as_deref()),
            )
            .await
            {
                Ok(result) => classify(result),
                Err(_) => Classified::Transient(format!(
                    "timed out after {:?}",
                    self.config.request_timeout
                )),
            };
            drop(permit);

            match outcome {
                Classified::Success(value) => return Ok(value),
                Classified::Fatal { status, reason } => {
                    return Err(FetchError::Fatal { status, reason });
                }
                Classified::AuthRequired if reauthenticated => {
                    return Err(FetchError::Unauthorized);
                }
                Classified::AuthRequired => {
                    // One re-authentication per logical call, outside the transient budget.
                    reauthenticated = true;
                    self.stats.reauths.fetch_add(1, Ordering::Relaxed);
                    debug!(path = %request.path, "401 received, refreshing token");
                    self.auth.refresh(generation).await?;
                }
                Classified::Transient(reason) => {
                    failures += 1;
                    if !self.config.retry.should_retry(failures) {
                        return Err(FetchError::Transient {
                            attempts: failures,
                            reason,
                        });
                    }
                    let delay = self.config.retry.delay_after(failures);
                    debug!(
                        path = %request.path,
                        attempt = failures,
                        delay = ?delay,
                        reason = %reason,
                        "transient failure, backing off"
                    );
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Take a concurrency permit and, when limited, a rate-limiter slot.
    ///
    /// A permit is never held while waiting on the limiter, so a throttled
    /// caller does not starve unthrottled ones.
    async fn acquire_slot(
        &self,
        limiter: Option<&WindowRateLimiter>,
    ) -> Result<OwnedSemaphorePermit, FetchError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| FetchError::Cancelled)?
                }
            };

            let Some(limiter) = limiter else {
                return Ok(permit);
            };

            match limiter.try_acquire() {
                Ok(()) => return Ok(permit),
                Err(wait) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("config", &self.config)
            .field("available_slots", &self.available_slots())
            .field("auth", &self.auth)
            .finish()
    }
}
