//! Transport selection and the per-attempt fetch pipeline.
//!
//! Each attempt runs: breaker admission check → site throttle → breaker-wrapped
//! transport call under a per-attempt timeout (raced against cancellation). The attempt is wrapped by the
//! transport's [`RetryPolicy`], which retries the same error kinds the
//! transport's breaker counts as failures.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::error::{ErrorKind, FetchError};
use crate::models::{Content, SiteFetchConfig, TransportKind};
use crate::reporter::{AttemptOutcome, FetchEvent, FetchReporter};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::throttle::SiteThrottle;
use crate::traits::Transport;

/// Hosts that are known to render their content client-side.
pub const DEFAULT_SCRIPT_HEAVY_DOMAINS: &[&str] = &["google.", "facebook.", "linkedin.", "github."];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Backoff template. `max_attempts` is replaced per site.
    pub retry: RetryConfig,
    /// Host substrings that go straight to the browser transport.
    pub script_heavy_domains: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            script_heavy_domains: DEFAULT_SCRIPT_HEAVY_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

/// Owns both transports and their breakers for the lifetime of a run.
pub struct FetchOrchestrator<H, B> {
    http: H,
    browser: B,
    http_breaker: CircuitBreaker,
    browser_breaker: CircuitBreaker,
    throttle: SiteThrottle,
    config: OrchestratorConfig,
}

impl<H, B> FetchOrchestrator<H, B>
where
    H: Transport,
    B: Transport,
{
    pub fn new(
        http: H,
        browser: B,
        http_breaker: CircuitBreakerConfig,
        browser_breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            http,
            browser,
            http_breaker: CircuitBreaker::new(TransportKind::Http.as_str(), http_breaker),
            browser_breaker: CircuitBreaker::new(TransportKind::Browser.as_str(), browser_breaker),
            throttle: SiteThrottle::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_throttle(mut self, throttle: SiteThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn breaker(&self, kind: TransportKind) -> &CircuitBreaker {
        match kind {
            TransportKind::Http => &self.http_breaker,
            TransportKind::Browser => &self.browser_breaker,
        }
    }

    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        vec![self.http_breaker.stats(), self.browser_breaker.stats()]
    }

    fn is_script_heavy(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| {
            self.config
                .script_heavy_domains
                .iter()
                .any(|domain| host.contains(domain.as_str()))
        })
    }

    /// Picks the first transport and whether escalation to the browser is
    /// allowed if it turns out the page needs script execution.
    pub fn select_transport(&self, url: &Url, site: &SiteFetchConfig) -> (TransportKind, bool) {
        if let Some(kind) = site.preferred_transport {
            return (kind, false);
        }
        if self.is_script_heavy(url) {
            return (TransportKind::Browser, false);
        }
        (TransportKind::Http, true)
    }

    /// Fetches `url` under the site's limits, escalating from HTTP to the
    /// browser at most once.
    pub async fn fetch<R: FetchReporter>(
        &self,
        url: &str,
        site: &SiteFetchConfig,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<Content, FetchError> {
        let parsed =
            Url::parse(url).map_err(|e| FetchError::InvalidRequest(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidRequest(format!(
                "unsupported scheme '{}' in {url}",
                parsed.scheme()
            )));
        }

        let (initial, may_escalate) = self.select_transport(&parsed, site);
        let result = self.fetch_with(initial, url, site, cancel, reporter).await;

        match result {
            Err(e) if may_escalate && e.root().kind() == ErrorKind::ScriptRequired => {
                let reason = e.root().to_string();
                reporter.report(FetchEvent::Escalated {
                    url,
                    from: initial,
                    to: TransportKind::Browser,
                    reason: &reason,
                });
                self.fetch_with(TransportKind::Browser, url, site, cancel, reporter)
                    .await
            }
            other => other,
        }
    }

    async fn fetch_with<R: FetchReporter>(
        &self,
        kind: TransportKind,
        url: &str,
        site: &SiteFetchConfig,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<Content, FetchError> {
        match kind {
            TransportKind::Http => {
                self.fetch_via(&self.http, &self.http_breaker, url, site, cancel, reporter)
                    .await
            }
            TransportKind::Browser => {
                self.fetch_via(&self.browser, &self.browser_breaker, url, site, cancel, reporter)
                    .await
            }
        }
    }

    async fn fetch_via<T: Transport, R: FetchReporter>(
        &self,
        transport: &T,
        breaker: &CircuitBreaker,
        url: &str,
        site: &SiteFetchConfig,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<Content, FetchError> {
        let policy = RetryPolicy::for_breaker(
            self.config.retry.clone().with_max_attempts(site.max_attempts),
            breaker,
        );

        policy
            .execute_gated(breaker, cancel, |attempt| {
                self.attempt(transport, breaker, url, site, cancel, reporter, attempt)
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt<T: Transport, R: FetchReporter>(
        &self,
        transport: &T,
        breaker: &CircuitBreaker,
        url: &str,
        site: &SiteFetchConfig,
        cancel: &CancellationToken,
        reporter: &R,
        attempt: u32,
    ) -> Result<Content, FetchError> {
        let mut started = Instant::now();

        let result = match breaker.check() {
            Err(open) => Err(open),
            Ok(()) => match self.throttle.wait(url, site.request_delay, cancel).await {
                Err(cancelled) => Err(cancelled),
                Ok(()) => {
                    started = Instant::now();
                    breaker
                        .call(|| Self::timed_fetch(transport, url, site.timeout, cancel))
                        .await
                }
            },
        };

        let latency = started.elapsed();
        let outcome = match &result {
            Ok(content) => AttemptOutcome::Success {
                status: content.status,
            },
            Err(e) => AttemptOutcome::Failure(e),
        };
        reporter.report(FetchEvent::Attempt {
            url,
            transport: transport.kind(),
            phase: breaker.state(),
            attempt,
            outcome,
            latency,
        });

        result
    }

    async fn timed_fetch<T: Transport>(
        transport: &T,
        url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Content, FetchError> {
        tokio::select! {
            res = tokio::time::timeout(timeout, transport.fetch(url, timeout)) => {
                res.unwrap_or(Err(FetchError::Timeout(timeout)))
            }
            () = cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }
}
