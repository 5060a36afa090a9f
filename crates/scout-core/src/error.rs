use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::TransportKind;

/// Closed classification of fetch failures.
///
/// Breakers and retry policies decide what counts as a failure by looking up
/// the kind in a [`FailureKinds`] table, never by inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited,
    ServerError,
    ClientError,
    ScriptRequired,
    InvalidRequest,
    CircuitOpen,
    TransportUnavailable,
    Cancelled,
    ExhaustedRetries,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::ScriptRequired => "script_required",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of error kinds a breaker counts as failures and a retry policy
/// retries.
///
/// `CircuitOpen`, `Cancelled` and `ExhaustedRetries` are sentinels and are
/// never admitted to the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ErrorKind>", into = "Vec<ErrorKind>")]
pub struct FailureKinds(Vec<ErrorKind>);

impl FailureKinds {
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        let mut set: Vec<ErrorKind> = Vec::new();
        for kind in kinds {
            let sentinel = matches!(
                kind,
                ErrorKind::CircuitOpen | ErrorKind::Cancelled | ErrorKind::ExhaustedRetries
            );
            if !sentinel && !set.contains(&kind) {
                set.push(kind);
            }
        }
        Self(set)
    }

    /// Transport errors, timeouts, rate-limit signals and 5xx responses.
    pub fn transient() -> Self {
        Self::new([
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::RateLimited,
            ErrorKind::ServerError,
        ])
    }

    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.0.contains(&kind)
    }

    /// Whether `error` belongs to this set.
    pub fn matches(&self, error: &FetchError) -> bool {
        self.contains(error.kind())
    }

    pub fn iter(&self) -> impl Iterator<Item = ErrorKind> + '_ {
        self.0.iter().copied()
    }
}

impl Default for FailureKinds {
    fn default() -> Self {
        Self::transient()
    }
}

impl From<Vec<ErrorKind>> for FailureKinds {
    fn from(kinds: Vec<ErrorKind>) -> Self {
        Self::new(kinds)
    }
}

impl From<FailureKinds> for Vec<ErrorKind> {
    fn from(kinds: FailureKinds) -> Self {
        kinds.0
    }
}

/// Typed outcome of a failed fetch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Connection, DNS or TLS failure.
    #[error("Network error: {0}")]
    Network(String),

    /// A single attempt exceeded its timeout.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Explicit 429 / throttle signal from the origin.
    #[error("Rate limited by origin")]
    RateLimited { retry_after: Option<Duration> },

    /// Non-success HTTP status other than 429.
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    /// Empty body or bot-block page; only a browser can render it.
    #[error("Page requires script execution: {0}")]
    ScriptRequired(String),

    /// Malformed URL or request that can never succeed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Gate rejection; the transport was not invoked.
    #[error(
        "Circuit breaker '{transport}' is open. Retry after {} seconds.",
        retry_after.as_secs()
    )]
    CircuitOpen {
        transport: String,
        retry_after: Duration,
    },

    #[error("Transport '{0}' is not available in this build")]
    TransportUnavailable(TransportKind),

    #[error("Fetch cancelled")]
    Cancelled,

    /// Every permitted attempt failed; `last` is the final failure.
    #[error("Gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(_) => ErrorKind::Network,
            FetchError::Timeout(_) => ErrorKind::Timeout,
            FetchError::RateLimited { .. } => ErrorKind::RateLimited,
            FetchError::Http { status, .. } if *status >= 500 => ErrorKind::ServerError,
            FetchError::Http { .. } => ErrorKind::ClientError,
            FetchError::ScriptRequired(_) => ErrorKind::ScriptRequired,
            FetchError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            FetchError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            FetchError::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
        }
    }

    /// The innermost failure, looking through `ExhaustedRetries`.
    pub fn root(&self) -> &FetchError {
        match self {
            FetchError::ExhaustedRetries { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Application-wide error types for Scout.
#[derive(Error, Debug)]
pub enum AppError {
    /// Fetching a page failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Extraction could not make sense of fetched content.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Settings file or environment is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Short stable label used in session summaries.
    pub fn label(&self) -> &'static str {
        match self {
            AppError::Fetch(e) => e.kind().as_str(),
            AppError::ParseError(_) => "parse_error",
            AppError::ConfigError(_) => "config_error",
            AppError::DatabaseError(_) => "database_error",
            AppError::SerializationError(_) => "serialization_error",
            AppError::Generic(_) => "error",
        }
    }
}
