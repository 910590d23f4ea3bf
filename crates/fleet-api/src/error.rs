use thiserror::Error;

/// Failure of a single logical fetch after the retry policy has run its course.
///
/// Callers treat any variant as "no data for this call" and carry on; none of
/// them is meant to abort a surrounding pagination or enrichment loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Every transient attempt failed (timeout, connection error, 5xx).
    #[error("transient failure after {attempts} attempt(s): {reason}")]
    Transient { attempts: u32, reason: String },

    /// Non-retryable client error or malformed response.
    #[error("fatal failure{}: {reason}", status_suffix(.status))]
    Fatal { status: Option<u16>, reason: String },

    /// The request was still rejected with 401 after one re-authentication.
    #[error("unauthorized after re-authentication")]
    Unauthorized,

    /// Obtaining a fresh token failed.
    #[error("re-authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Shutdown was requested before the call could be issued.
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn fatal(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Fatal {
            status,
            reason: reason.into(),
        }
    }

    /// Whether the failure came from the shutdown signal rather than the API.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Errors raised while obtaining a bearer token.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("login rejected with HTTP {0}")]
    Rejected(u16),

    #[error("login response did not contain a token")]
    MissingToken,

    #[error("login transport error: {0}")]
    Transport(String),

    #[error("no credentials configured")]
    NoCredentials,
}

/// Coarse category of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Io,
    /// The request could not be built (bad URL, bad header value).
    Request,
}

/// Failure below the HTTP status line: nothing usable came back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Request-construction errors are deterministic and will not heal on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, TransportErrorKind::Request)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_builder() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Io
        };
        Self::new(kind, err.to_string())
    }
}
