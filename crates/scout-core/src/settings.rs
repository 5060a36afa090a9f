//! YAML settings: global scraping defaults, breaker tuning and the site list.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{AppError, FailureKinds};
use crate::models::{ScrapeTarget, SiteFetchConfig, TargetKind, TransportKind};
use crate::orchestrator::{DEFAULT_SCRIPT_HEAVY_DOMAINS, OrchestratorConfig};
use crate::retry::RetryConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const MIN_REQUEST_DELAY: f64 = 0.1;
const MAX_CONCURRENCY: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scraping: ScrapingSettings,
    pub breakers: BreakerSettings,
    pub sites: Vec<SiteSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingSettings {
    pub max_concurrent_requests: usize,
    /// Seconds between requests to one site.
    pub request_delay: f64,
    /// Per-attempt timeout in seconds.
    pub timeout: f64,
    /// Attempts per transport, including the first.
    pub max_retries: u32,
    pub user_agent: String,
    pub backoff_factor: f64,
    /// Seconds.
    pub initial_backoff: f64,
    /// Seconds.
    pub max_backoff: f64,
    pub jitter: bool,
    pub script_heavy_domains: Vec<String>,
}

impl Default for ScrapingSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            request_delay: 1.0,
            timeout: 30.0,
            max_retries: 3,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backoff_factor: 2.0,
            initial_backoff: 1.0,
            max_backoff: 60.0,
            jitter: true,
            script_heavy_domains: DEFAULT_SCRIPT_HEAVY_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub http: BreakerTuning,
    pub browser: BreakerTuning,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            http: CircuitBreakerConfig::http().into(),
            browser: CircuitBreakerConfig::browser().into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerTuning {
    pub failure_threshold: u32,
    pub open_duration_secs: u64,
    #[serde(default)]
    pub failure_kinds: FailureKinds,
}

impl From<CircuitBreakerConfig> for BreakerTuning {
    fn from(config: CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            open_duration_secs: config.open_duration.as_secs(),
            failure_kinds: config.failure_kinds,
        }
    }
}

impl BreakerTuning {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_secs(self.open_duration_secs),
            failure_kinds: self.failure_kinds.clone(),
        }
    }
}

/// One configured site. Unset overrides fall back to `scraping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSettings {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub portfolio_url: Option<String>,
    #[serde(default)]
    pub team_url: Option<String>,
    #[serde(default)]
    pub article_urls: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub request_delay: Option<f64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub preferred_transport: Option<TransportKind>,
    /// Legacy spelling of `preferred_transport: browser`.
    #[serde(default)]
    pub use_playwright: bool,
}

fn default_active() -> bool {
    true
}

impl SiteSettings {
    pub fn transport(&self) -> Option<TransportKind> {
        self.preferred_transport
            .or(self.use_playwright.then_some(TransportKind::Browser))
    }

    fn urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str())
            .chain(self.portfolio_url.as_deref())
            .chain(self.team_url.as_deref())
            .chain(self.article_urls.iter().map(String::as_str))
    }
}

/// Which sites a run should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteSelection {
    /// Every active site.
    All,
    /// The named sites, whether active or not.
    Named(Vec<String>),
}

fn seconds(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

fn at_least(value: f64, min: f64) -> bool {
    value.is_finite() && value >= min
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn config_error(message: impl Into<String>) -> AppError {
    AppError::ConfigError(message.into())
}

fn check_url(site: &str, url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url)
        .map_err(|e| config_error(format!("site '{site}': invalid URL '{url}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(config_error(format!(
            "site '{site}': URL must be http(s) with a host: '{url}'"
        )));
    }
    Ok(())
}

impl Settings {
    /// Read, parse and validate a settings file.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, AppError> {
        let settings: Settings =
            serde_yaml::from_str(raw).map_err(|e| config_error(format!("invalid YAML: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let s = &self.scraping;
        if !(1..=MAX_CONCURRENCY).contains(&s.max_concurrent_requests) {
            return Err(config_error(format!(
                "max_concurrent_requests must be between 1 and {MAX_CONCURRENCY}, got {}",
                s.max_concurrent_requests
            )));
        }
        if !at_least(s.request_delay, MIN_REQUEST_DELAY) {
            return Err(config_error(format!(
                "request_delay must be at least {MIN_REQUEST_DELAY}s, got {}",
                s.request_delay
            )));
        }
        if !positive(s.timeout) {
            return Err(config_error("timeout must be positive"));
        }
        if s.max_retries == 0 {
            return Err(config_error("max_retries must be at least 1"));
        }
        if !at_least(s.backoff_factor, 1.0)
            || !at_least(s.initial_backoff, 0.0)
            || !at_least(s.max_backoff, 0.0)
        {
            return Err(config_error(
                "backoff_factor must be >= 1 and backoff durations non-negative",
            ));
        }

        for (name, tuning) in [("http", &self.breakers.http), ("browser", &self.breakers.browser)] {
            if tuning.failure_threshold == 0 {
                return Err(config_error(format!(
                    "breakers.{name}.failure_threshold must be at least 1"
                )));
            }
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            if site.name.trim().is_empty() {
                return Err(config_error("site name must not be empty"));
            }
            if !seen.insert(site.name.as_str()) {
                return Err(config_error(format!("duplicate site name '{}'", site.name)));
            }
            for url in site.urls() {
                check_url(&site.name, url)?;
            }
            if let Some(delay) = site.request_delay
                && !at_least(delay, MIN_REQUEST_DELAY)
            {
                return Err(config_error(format!(
                    "site '{}': request_delay must be at least {MIN_REQUEST_DELAY}s",
                    site.name
                )));
            }
            if let Some(timeout) = site.timeout
                && !positive(timeout)
            {
                return Err(config_error(format!(
                    "site '{}': timeout must be positive",
                    site.name
                )));
            }
            if site.max_retries == Some(0) {
                return Err(config_error(format!(
                    "site '{}': max_retries must be at least 1",
                    site.name
                )));
            }
        }

        Ok(())
    }

    pub fn site(&self, name: &str) -> Option<&SiteSettings> {
        self.sites.iter().find(|s| s.name == name)
    }

    pub fn active_sites(&self) -> impl Iterator<Item = &SiteSettings> {
        self.sites.iter().filter(|s| s.active)
    }

    /// Resolve a site's overrides against the global defaults.
    pub fn fetch_config_for(&self, site: &SiteSettings) -> SiteFetchConfig {
        let s = &self.scraping;
        let mut config = SiteFetchConfig::new(&site.name)
            .with_request_delay(seconds(
                site.request_delay.unwrap_or(s.request_delay),
                Duration::from_secs(1),
            ))
            .with_max_attempts(site.max_retries.unwrap_or(s.max_retries))
            .with_timeout(seconds(
                site.timeout.unwrap_or(s.timeout),
                Duration::from_secs(30),
            ));
        if let Some(transport) = site.transport() {
            config = config.with_transport(transport);
        }
        config
    }

    /// Portfolio, team and article targets for the selected sites.
    pub fn targets(&self, selection: &SiteSelection) -> Result<Vec<ScrapeTarget>, AppError> {
        let sites: Vec<&SiteSettings> = match selection {
            SiteSelection::All => self.active_sites().collect(),
            SiteSelection::Named(names) => names
                .iter()
                .map(|name| {
                    self.site(name)
                        .ok_or_else(|| config_error(format!("unknown site '{name}'")))
                })
                .collect::<Result<_, _>>()?,
        };

        let mut targets = Vec::new();
        for site in sites {
            let fetch = self.fetch_config_for(site);
            let portfolio = site.portfolio_url.as_deref().unwrap_or(&site.url);
            targets.push(ScrapeTarget::new(
                portfolio,
                TargetKind::Portfolio,
                fetch.clone(),
            ));
            if let Some(team) = &site.team_url {
                targets.push(ScrapeTarget::new(team, TargetKind::Team, fetch.clone()));
            }
            for article in &site.article_urls {
                targets.push(ScrapeTarget::new(
                    article,
                    TargetKind::Article,
                    fetch.clone(),
                ));
            }
        }
        Ok(targets)
    }

    pub fn retry_config(&self) -> RetryConfig {
        let s = &self.scraping;
        RetryConfig {
            max_attempts: s.max_retries,
            base_delay: seconds(s.initial_backoff, Duration::from_secs(1)),
            backoff_multiplier: s.backoff_factor,
            max_delay: seconds(s.max_backoff, Duration::from_secs(60)),
            jitter: s.jitter,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: self.retry_config(),
            script_heavy_domains: self.scraping.script_heavy_domains.clone(),
        }
    }
}
