//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::circuit_breaker::CircuitState;
use crate::error::{AppError, ErrorKind, FetchError};
use crate::models::{
    ChangeRecord, Content, ExtractedRecord, RecordKind, ResourceFingerprint, ResourceKey,
    ScrapeTarget, TransportKind,
};
use crate::reporter::{AttemptOutcome, FetchEvent, FetchReporter};
use crate::traits::{Extractor, FingerprintStore, MemoryStore, Transport};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Mock transport with a queue of canned results.
#[derive(Clone)]
pub struct MockTransport {
    kind: TransportKind,
    /// Each call pops the first element. When empty, `fallback` is used.
    responses: Arc<Mutex<Vec<Result<String, FetchError>>>>,
    fallback: Result<String, FetchError>,
    delay: Duration,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback: Ok("<html><body>default</body></html>".to_string()),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_responses(kind: TransportKind, responses: Vec<Result<String, FetchError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::new(kind)
        }
    }

    /// Fails every call with `error`.
    pub fn failing(kind: TransportKind, error: FetchError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::new(kind)
        }
    }

    /// Sleeps before answering, to exercise timeouts and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<Content, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                self.fallback.clone()
            } else {
                responses.remove(0)
            }
        };
        next.map(|body| Content::new(url, body, self.kind))
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor: `records` page records per content, or a queued error.
#[derive(Clone)]
pub struct MockExtractor {
    errors: Arc<Mutex<Vec<(String, AppError)>>>,
    records: usize,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self {
            errors: Arc::new(Mutex::new(Vec::new())),
            records: 1,
        }
    }

    /// Fail extraction for `url` once.
    pub fn with_error_for(url: &str, error: AppError) -> Self {
        Self {
            errors: Arc::new(Mutex::new(vec![(url.to_string(), error)])),
            records: 1,
        }
    }

    /// Emit `n` records per page, keyed `<url>#<i>`.
    pub fn with_records(mut self, n: usize) -> Self {
        self.records = n;
        self
    }
}

impl Extractor for MockExtractor {
    fn extract(
        &self,
        target: &ScrapeTarget,
        content: &Content,
    ) -> Result<Vec<ExtractedRecord>, AppError> {
        let mut errors = self.errors.lock().unwrap();
        if let Some(pos) = errors.iter().position(|(url, _)| *url == target.url) {
            return Err(errors.remove(pos).1);
        }

        if self.records == 1 {
            return Ok(vec![ExtractedRecord::new(
                RecordKind::Page,
                target.url.clone(),
                serde_json::json!({ "body": content.body }),
            )]);
        }

        Ok((0..self.records)
            .map(|i| {
                ExtractedRecord::new(
                    RecordKind::Page,
                    format!("{}#{i}", target.url),
                    serde_json::json!({ "body": content.body, "index": i }),
                )
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// Store whose writes fail after the first `healthy` change records; reads
/// and successful writes go to an inner `MemoryStore`.
#[derive(Clone, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    healthy: Arc<Mutex<usize>>,
}

impl FailingStore {
    /// Let the first `n` records persist before writes start failing.
    pub fn after(n: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            healthy: Arc::new(Mutex::new(n)),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl FingerprintStore for FailingStore {
    async fn get_fingerprint(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<ResourceFingerprint>, AppError> {
        self.inner.get_fingerprint(key).await
    }

    async fn upsert_fingerprint(
        &self,
        key: &ResourceKey,
        content_hash: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<ResourceFingerprint, AppError> {
        // Only keys whose change record made it through get a fingerprint.
        if self.inner.changes().iter().any(|c| c.resource == *key) {
            return self.inner.upsert_fingerprint(key, content_hash, seen_at).await;
        }
        Err(AppError::DatabaseError("connection lost".into()))
    }

    async fn record_change(&self, change: &ChangeRecord) -> Result<(), AppError> {
        {
            let mut healthy = self.healthy.lock().unwrap();
            if *healthy == 0 {
                return Err(AppError::DatabaseError("connection lost".into()));
            }
            *healthy -= 1;
        }
        self.inner.record_change(change).await
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Owned copy of a reported event.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportedEvent {
    Attempt {
        transport: TransportKind,
        phase: CircuitState,
        attempt: u32,
        /// `None` on success.
        error: Option<ErrorKind>,
    },
    Escalated {
        from: TransportKind,
        to: TransportKind,
    },
    TargetFailed {
        url: String,
    },
    SessionFinished,
}

#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<ReportedEvent>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReportedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<ReportedEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, ReportedEvent::Attempt { .. }))
            .collect()
    }
}

impl FetchReporter for MockReporter {
    fn report(&self, event: FetchEvent<'_>) {
        let recorded = match event {
            FetchEvent::Attempt {
                transport,
                phase,
                attempt,
                outcome,
                ..
            } => ReportedEvent::Attempt {
                transport,
                phase,
                attempt,
                error: match outcome {
                    AttemptOutcome::Success { .. } => None,
                    AttemptOutcome::Failure(e) => Some(e.kind()),
                },
            },
            FetchEvent::Escalated { from, to, .. } => ReportedEvent::Escalated { from, to },
            FetchEvent::TargetFailed { url, .. } => ReportedEvent::TargetFailed {
                url: url.to_string(),
            },
            FetchEvent::SessionFinished { .. } => ReportedEvent::SessionFinished,
        };
        self.events.lock().unwrap().push(recorded);
    }
}
