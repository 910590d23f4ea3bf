//! Bearer-token state shared by every call of one client.
//!
//! The token is owned by [`AuthState`] rather than mutated into a global
//! header map. Each issued request records the generation of the token it
//! carried; a 401 hands that generation back to [`AuthState::refresh`], which
//! only logs in again if nobody else already replaced that token.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::transport::{ApiRequest, Transport};

pub const LOGIN_PATH: &str = "/auth/login";

/// Source of fresh bearer tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn login(&self) -> Result<String, AuthError>;
}

/// Obtains a token from `POST /auth/login {username, password}`.
pub struct LoginTokenProvider {
    transport: Arc<dyn Transport>,
    username: String,
    password: String,
}

impl LoginTokenProvider {
    pub fn new(
        transport: Arc<dyn Transport>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

#[async_trait]
impl TokenProvider for LoginTokenProvider {
    async fn login(&self) -> Result<String, AuthError> {
        let request = ApiRequest::post(
            LOGIN_PATH,
            json!({ "username": self.username, "password": self.password }),
        );
        let response = self
            .transport
            .send(&request, None)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !(200..300).contains(&response.status) {
            return Err(AuthError::Rejected(response.status));
        }

        let parsed: LoginResponse =
            serde_json::from_str(&response.body).map_err(|_| AuthError::MissingToken)?;
        match parsed.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(AuthError::MissingToken),
        }
    }
}

/// Hands out a fixed, externally issued token.
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn login(&self) -> Result<String, AuthError> {
        if self.0.is_empty() {
            return Err(AuthError::NoCredentials);
        }
        Ok(self.0.clone())
    }
}

pub struct AuthState {
    token: RwLock<Option<String>>,
    generation: AtomicU64,
    logins: AtomicU64,
    refresh_lock: Mutex<()>,
    provider: Arc<dyn TokenProvider>,
}

impl AuthState {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            token: RwLock::new(None),
            generation: AtomicU64::new(0),
            logins: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
            provider,
        }
    }

    /// Seed the state with a token obtained elsewhere.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        *self.token.write() = Some(token.into());
        self
    }

    /// Current token and the generation it belongs to.
    pub fn current(&self) -> (Option<String>, u64) {
        let token = self.token.read().clone();
        (token, self.generation.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of successful logins performed through this state.
    pub fn logins(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    /// Log in unconditionally, e.g. once at startup.
    pub async fn login(&self) -> Result<(), AuthError> {
        let stale = self.generation();
        self.refresh(stale).await
    }

    /// Replace the token if it is still the one from `stale_generation`.
    ///
    /// Concurrent callers that saw the same stale token are serialized on the
    /// refresh lock; only the first one actually calls the provider.
    pub async fn refresh(&self, stale_generation: u64) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != stale_generation {
            debug!("token already refreshed by a concurrent caller");
            return Ok(());
        }

        match self.provider.login().await {
            Ok(token) => {
                *self.token.write() = Some(token);
                self.generation.fetch_add(1, Ordering::AcqRel);
                self.logins.fetch_add(1, Ordering::Relaxed);
                info!("bearer token refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "re-authentication failed");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("has_token", &self.token.read().is_some())
            .field("generation", &self.generation())
            .field("logins", &self.logins())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct CountingProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn login(&self) -> Result<String, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(format!("token-{n}"))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl TokenProvider for FailingProvider {
        async fn login(&self) -> Result<String, AuthError> {
            Err(AuthError::Rejected(403))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_logs_in_once() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
        });
        let auth = Arc::new(AuthState::new(provider.clone()).with_token("expired"));
        let (_, generation) = auth.current();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move { auth.refresh(generation).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.logins(), 1);
        assert_eq!(auth.current(), (Some("token-1".to_string()), generation + 1));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_generation() {
        let auth = AuthState::new(Arc::new(FailingProvider)).with_token("old");
        let err = auth.refresh(0).await.unwrap_err();

        assert_eq!(err, AuthError::Rejected(403));
        assert_eq!(auth.current(), (Some("old".to_string()), 0));
        assert_eq!(auth.logins(), 0);
    }

    #[tokio::test]
    async fn test_static_provider() {
        let auth = AuthState::new(Arc::new(StaticTokenProvider::new("abc")));
        auth.login().await.unwrap();
        assert_eq!(auth.current().0.as_deref(), Some("abc"));

        let empty = StaticTokenProvider::new("");
        assert_eq!(empty.login().await.unwrap_err(), AuthError::NoCredentials);
    }
}
