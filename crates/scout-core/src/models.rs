use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Mechanism used to fetch a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Lightweight HTTP client, no script execution.
    Http,
    /// Headless browser that renders JavaScript.
    Browser,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Browser => "browser",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "requests" => Ok(TransportKind::Http),
            "browser" | "playwright" => Ok(TransportKind::Browser),
            _ => Err(format!("Unknown transport: {s}")),
        }
    }
}

/// A successfully fetched page.
#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub body: String,
    pub status: u16,
    pub transport: TransportKind,
    pub fetched_at: DateTime<Utc>,
    pub latency: Duration,
}

impl Content {
    pub fn new(url: impl Into<String>, body: impl Into<String>, transport: TransportKind) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            body: body.into(),
            status: 200,
            transport,
            fetched_at: Utc::now(),
            latency: Duration::ZERO,
        }
    }
}

/// Per-site fetch overrides, resolved against the global scraping defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteFetchConfig {
    pub site: String,
    pub preferred_transport: Option<TransportKind>,
    /// Minimum spacing between requests to this site.
    pub request_delay: Duration,
    pub max_attempts: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl SiteFetchConfig {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            preferred_transport: None,
            request_delay: Duration::from_secs(1),
            max_attempts: 3,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.preferred_transport = Some(transport);
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What kind of page a target points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Portfolio,
    Team,
    Article,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Portfolio => "portfolio",
            TargetKind::Team => "team",
            TargetKind::Article => "article",
        }
    }
}

/// One page to fetch during a session.
#[derive(Debug, Clone)]
pub struct ScrapeTarget {
    pub site: String,
    pub url: String,
    pub kind: TargetKind,
    pub fetch: SiteFetchConfig,
}

impl ScrapeTarget {
    pub fn new(url: impl Into<String>, kind: TargetKind, fetch: SiteFetchConfig) -> Self {
        Self {
            site: fetch.site.clone(),
            url: url.into(),
            kind,
            fetch,
        }
    }
}

/// Kind of structured record produced by extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Company,
    TeamMember,
    Deal,
    Page,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Company => "company",
            RecordKind::TeamMember => "team_member",
            RecordKind::Deal => "deal",
            RecordKind::Page => "page",
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(RecordKind::Company),
            "team_member" => Ok(RecordKind::TeamMember),
            "deal" => Ok(RecordKind::Deal),
            "page" => Ok(RecordKind::Page),
            _ => Err(format!("Unknown record kind: {s}")),
        }
    }
}

/// A structured record handed back by the extraction collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedRecord {
    pub kind: RecordKind,
    /// Stable identifier within the site, e.g. a company URL or slug.
    pub key: String,
    pub data: serde_json::Value,
}

impl ExtractedRecord {
    pub fn new(kind: RecordKind, key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind,
            key: key.into(),
            data,
        }
    }
}

/// Stable identity of a trackable unit of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub site: String,
    pub key: String,
}

impl ResourceKey {
    pub fn new(site: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.site, self.key)
    }
}

/// Last known digest of a resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceFingerprint {
    pub resource: ResourceKey,
    /// SHA-256 of the normalized content, 64-char hex.
    pub content_hash: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Result of comparing fresh content against the stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOutcome {
    New,
    Changed,
    Unchanged,
}

impl ChangeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOutcome::New => "new",
            ChangeOutcome::Changed => "changed",
            ChangeOutcome::Unchanged => "unchanged",
        }
    }

    /// Whether the caller should persist a fingerprint and change record.
    pub fn is_change(&self) -> bool {
        !matches!(self, ChangeOutcome::Unchanged)
    }
}

impl fmt::Display for ChangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ChangeOutcome::New),
            "changed" => Ok(ChangeOutcome::Changed),
            "unchanged" => Ok(ChangeOutcome::Unchanged),
            _ => Err(format!("Unknown change outcome: {s}")),
        }
    }
}

/// A persisted change event.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub resource: ResourceKey,
    pub outcome: ChangeOutcome,
    pub record_kind: RecordKind,
    pub previous_hash: Option<String>,
    pub new_hash: String,
    /// Normalized snapshot of the record at detection time.
    pub details: serde_json::Value,
    pub session_id: Uuid,
    pub detected_at: DateTime<Utc>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
