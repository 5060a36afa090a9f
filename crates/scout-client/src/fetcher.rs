use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use scout_core::detect::script_required;
use scout_core::error::{AppError, FetchError};
use scout_core::models::{Content, TransportKind};
use scout_core::settings::DEFAULT_USER_AGENT;
use scout_core::traits::Transport;
use url::Url;

/// Lightweight HTTP transport using reqwest.
///
/// Maps responses onto the fetch taxonomy: 429 becomes `RateLimited` (with
/// `Retry-After` when present), other non-success statuses become `Http`,
/// and empty or bot-wall pages become `ScriptRequired` so the orchestrator
/// can escalate to the browser.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: &str) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );

        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::Generic(format!("HTTP client error: {e}")))?;

        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Content, FetchError> {
        check_scheme(url)?;
        let started = Instant::now();

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let final_url = response.url().to_string();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }

        if !status.is_success() {
            // A 403/503 carrying a challenge page means a browser might get through.
            if matches!(status.as_u16(), 403 | 503) {
                let body = response.text().await.unwrap_or_default();
                if !body.trim().is_empty()
                    && let Some(reason) = script_required(status.as_u16(), &body)
                {
                    return Err(FetchError::ScriptRequired(reason.to_string()));
                }
            }
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.text().await.map_err(|e| classify(e, timeout))?;

        if let Some(reason) = script_required(status.as_u16(), &body) {
            return Err(FetchError::ScriptRequired(reason.to_string()));
        }

        tracing::debug!(url, status = status.as_u16(), bytes = body.len(), "HTTP fetch complete");

        Ok(Content {
            url: url.to_string(),
            final_url,
            body,
            status: status.as_u16(),
            transport: TransportKind::Http,
            fetched_at: Utc::now(),
            latency: started.elapsed(),
        })
    }
}

fn check_scheme(url: &str) -> Result<(), FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidRequest(format!("Invalid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(FetchError::InvalidRequest(format!(
            "URL scheme '{scheme}' is not allowed (only http/https)"
        ))),
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(timeout)
    } else if e.is_builder() {
        FetchError::InvalidRequest(e.to_string())
    } else if e.is_connect() {
        FetchError::Network(format!("Connection failed: {e}"))
    } else {
        FetchError::Network(e.to_string())
    }
}

/// Seconds form of `Retry-After`. The HTTP-date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
