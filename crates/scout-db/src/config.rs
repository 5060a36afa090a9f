use std::time::Duration;

use scout_core::AppError;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the fingerprint store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Reads `DATABASE_URL` (required) and `DATABASE_MAX_CONNECTIONS`
    /// (optional, defaults to 5).
    pub fn from_env() -> Result<Self, AppError> {
        Self::optional_from_env()?.ok_or_else(|| {
            AppError::ConfigError("DATABASE_URL not set. Required for change tracking.".into())
        })
    }

    /// Like [`from_env`](Self::from_env) but yields `None` when no database
    /// is configured, for runs that can fall back to an in-memory store.
    pub fn optional_from_env() -> Result<Option<Self>, AppError> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return Ok(None);
        };

        let mut config = Self::new(url);
        if let Ok(raw) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = parse_max_connections(&raw)?;
        }
        Ok(Some(config))
    }
}

fn parse_max_connections(raw: &str) -> Result<u32, AppError> {
    match raw.trim().parse::<u32>() {
        Ok(0) => Err(AppError::ConfigError(
            "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
        )),
        Ok(n) => Ok(n),
        Err(_) => Err(AppError::ConfigError(format!(
            "Invalid DATABASE_MAX_CONNECTIONS '{raw}': must be a positive integer"
        ))),
    }
}
