use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::change::ChangeDetector;
use crate::circuit_breaker::CircuitBreakerStats;
use crate::error::{AppError, FetchError};
use crate::models::{
    ChangeOutcome, ChangeRecord, Content, ExtractedRecord, ResourceKey, ScrapeTarget,
};
use crate::orchestrator::FetchOrchestrator;
use crate::reporter::{FetchEvent, FetchReporter};
use crate::traits::{Extractor, FingerprintStore, Transport};

/// Configuration for a scrape session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of targets processed at once.
    pub concurrency: usize,
    /// Detect changes but never write to the store.
    pub dry_run: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            dry_run: false,
        }
    }
}

impl SessionConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A target that did not complete.
#[derive(Debug, Clone, Serialize)]
pub struct TargetError {
    pub site: String,
    pub url: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub targets: usize,
    pub pages_fetched: usize,
    pub records_found: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub errors: Vec<TargetError>,
    /// Targets skipped or interrupted by cancellation.
    pub cancelled: usize,
    pub breakers: Vec<CircuitBreakerStats>,
}

impl SessionSummary {
    fn add(&mut self, report: &TargetReport) {
        self.records_found += report.records;
        self.new += report.new;
        self.changed += report.changed;
        self.unchanged += report.unchanged;
    }

    pub fn changes_detected(&self) -> usize {
        self.new + self.changed
    }

    /// Targets that were fetched, extracted and checked without error.
    pub fn succeeded(&self) -> usize {
        self.targets - self.errors.len() - self.cancelled
    }
}

/// Per-target counts. New and changed records are only counted once they
/// are persisted (or would have been, in a dry run).
#[derive(Debug, Default)]
struct TargetReport {
    records: usize,
    new: usize,
    changed: usize,
    unchanged: usize,
}

impl TargetReport {
    fn tally(&mut self, outcome: ChangeOutcome) {
        match outcome {
            ChangeOutcome::New => self.new += 1,
            ChangeOutcome::Changed => self.changed += 1,
            ChangeOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

enum TargetResult {
    Done(TargetReport),
    /// `report` holds whatever completed before the failure.
    Failed {
        fetched: bool,
        report: TargetReport,
        error: TargetError,
    },
    Cancelled,
}

/// Drives one pass over a set of targets.
pub struct ScrapeSession<H, B, E, S> {
    orchestrator: FetchOrchestrator<H, B>,
    extractor: E,
    store: S,
    detector: ChangeDetector,
    config: SessionConfig,
}

impl<H, B, E, S> ScrapeSession<H, B, E, S>
where
    H: Transport,
    B: Transport,
    E: Extractor,
    S: FingerprintStore,
{
    pub fn new(orchestrator: FetchOrchestrator<H, B>, extractor: E, store: S) -> Self {
        Self {
            orchestrator,
            extractor,
            store,
            detector: ChangeDetector::new(),
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_detector(mut self, detector: ChangeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn orchestrator(&self) -> &FetchOrchestrator<H, B> {
        &self.orchestrator
    }

    /// Processes every target and returns the summary. Per-target failures
    /// are recorded, never propagated.
    pub async fn run<R: FetchReporter>(
        &self,
        targets: &[ScrapeTarget],
        cancel: &CancellationToken,
        reporter: &R,
    ) -> SessionSummary {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();

        tracing::info!(
            %session_id,
            targets = targets.len(),
            concurrency = self.config.concurrency,
            dry_run = self.config.dry_run,
            "Starting scrape session"
        );

        let results: Vec<TargetResult> = futures::stream::iter(targets)
            .map(|target| self.process_target(session_id, target, cancel, reporter))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut summary = SessionSummary {
            session_id,
            started_at,
            finished_at: started_at,
            dry_run: self.config.dry_run,
            targets: targets.len(),
            pages_fetched: 0,
            records_found: 0,
            new: 0,
            changed: 0,
            unchanged: 0,
            errors: Vec::new(),
            cancelled: 0,
            breakers: Vec::new(),
        };

        for result in results {
            match result {
                TargetResult::Done(report) => {
                    summary.pages_fetched += 1;
                    summary.add(&report);
                }
                TargetResult::Failed {
                    fetched,
                    report,
                    error,
                } => {
                    if fetched {
                        summary.pages_fetched += 1;
                    }
                    summary.add(&report);
                    summary.errors.push(error);
                }
                TargetResult::Cancelled => summary.cancelled += 1,
            }
        }

        summary.finished_at = Utc::now();
        summary.breakers = self.orchestrator.breaker_stats();
        reporter.report(FetchEvent::SessionFinished { summary: &summary });

        summary
    }

    async fn process_target<R: FetchReporter>(
        &self,
        session_id: Uuid,
        target: &ScrapeTarget,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> TargetResult {
        if cancel.is_cancelled() {
            return TargetResult::Cancelled;
        }

        let content = match self
            .orchestrator
            .fetch(&target.url, &target.fetch, cancel, reporter)
            .await
        {
            Ok(content) => content,
            Err(FetchError::Cancelled) => return TargetResult::Cancelled,
            Err(e) => {
                return Self::failed(
                    target,
                    false,
                    TargetReport::default(),
                    &AppError::from(e),
                    reporter,
                );
            }
        };

        match self.process_content(session_id, target, &content).await {
            (report, None) => {
                tracing::info!(
                    site = %target.site,
                    url = %target.url,
                    records = report.records,
                    new = report.new,
                    changed = report.changed,
                    "Target processed"
                );
                TargetResult::Done(report)
            }
            (report, Some(e)) => Self::failed(target, true, report, &e, reporter),
        }
    }

    fn failed<R: FetchReporter>(
        target: &ScrapeTarget,
        fetched: bool,
        report: TargetReport,
        error: &AppError,
        reporter: &R,
    ) -> TargetResult {
        let message = error.to_string();
        reporter.report(FetchEvent::TargetFailed {
            site: &target.site,
            url: &target.url,
            error: &message,
        });
        TargetResult::Failed {
            fetched,
            report,
            error: TargetError {
                site: target.site.clone(),
                url: target.url.clone(),
                kind: error.label().to_string(),
                message,
            },
        }
    }

    /// Stops at the first failing record; the report keeps everything
    /// handled before it.
    async fn process_content(
        &self,
        session_id: Uuid,
        target: &ScrapeTarget,
        content: &Content,
    ) -> (TargetReport, Option<AppError>) {
        let records = match self.extractor.extract(target, content) {
            Ok(records) => records,
            Err(e) => return (TargetReport::default(), Some(e)),
        };
        let mut report = TargetReport {
            records: records.len(),
            ..Default::default()
        };

        for record in &records {
            match self.process_record(session_id, target, record).await {
                Ok(outcome) => report.tally(outcome),
                Err(e) => return (report, Some(e)),
            }
        }

        (report, None)
    }

    async fn process_record(
        &self,
        session_id: Uuid,
        target: &ScrapeTarget,
        record: &ExtractedRecord,
    ) -> Result<ChangeOutcome, AppError> {
        let key = ResourceKey::new(&target.site, &record.key);
        let detection = self.detector.detect(&self.store, &key, &record.data).await?;

        if !detection.outcome.is_change() || self.config.dry_run {
            return Ok(detection.outcome);
        }

        let now = Utc::now();
        // Change first: a failed write leaves the old fingerprint, so the
        // change is detected again next run.
        self.store
            .record_change(&ChangeRecord {
                resource: key.clone(),
                outcome: detection.outcome,
                record_kind: record.kind,
                previous_hash: detection.previous,
                new_hash: detection.hash.clone(),
                details: detection.normalized,
                session_id,
                detected_at: now,
            })
            .await?;
        self.store
            .upsert_fingerprint(&key, &detection.hash, now)
            .await?;

        Ok(detection.outcome)
    }
}
