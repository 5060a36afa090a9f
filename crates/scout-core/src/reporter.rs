use std::time::Duration;

use crate::circuit_breaker::CircuitState;
use crate::error::FetchError;
use crate::models::TransportKind;
use crate::session::SessionSummary;

/// How a single transport attempt ended.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    Success { status: u16 },
    Failure(&'a FetchError),
}

impl AttemptOutcome<'_> {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success { .. } => "success",
            AttemptOutcome::Failure(e) => e.kind().as_str(),
        }
    }
}

/// Events emitted while fetching, for monitoring/logging.
#[derive(Debug, Clone)]
pub enum FetchEvent<'a> {
    /// One transport attempt, including those rejected by an open breaker.
    Attempt {
        url: &'a str,
        transport: TransportKind,
        /// Breaker phase after the attempt.
        phase: CircuitState,
        attempt: u32,
        outcome: AttemptOutcome<'a>,
        latency: Duration,
    },
    Escalated {
        url: &'a str,
        from: TransportKind,
        to: TransportKind,
        reason: &'a str,
    },
    TargetFailed {
        site: &'a str,
        url: &'a str,
        error: &'a str,
    },
    SessionFinished {
        summary: &'a SessionSummary,
    },
}

/// Trait for receiving fetch events (decoupled logging).
pub trait FetchReporter: Send + Sync {
    fn report(&self, event: FetchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FetchReporter for TracingReporter {
    fn report(&self, event: FetchEvent<'_>) {
        match event {
            FetchEvent::Attempt {
                url,
                transport,
                phase,
                attempt,
                outcome,
                latency,
            } => {
                let latency_ms = latency.as_millis() as u64;
                match outcome {
                    AttemptOutcome::Success { status } => tracing::info!(
                        %url, %transport, %phase, attempt, status, latency_ms,
                        "Fetch attempt succeeded"
                    ),
                    AttemptOutcome::Failure(error) => tracing::warn!(
                        %url, %transport, %phase, attempt, latency_ms,
                        outcome = %error.kind(), %error,
                        "Fetch attempt failed"
                    ),
                }
            }
            FetchEvent::Escalated {
                url,
                from,
                to,
                reason,
            } => {
                tracing::info!(%url, %from, %to, %reason, "Escalating transport");
            }
            FetchEvent::TargetFailed { site, url, error } => {
                tracing::error!(%site, %url, %error, "Target failed");
            }
            FetchEvent::SessionFinished { summary } => {
                tracing::info!(
                    session_id = %summary.session_id,
                    targets = summary.targets,
                    pages_fetched = summary.pages_fetched,
                    records = summary.records_found,
                    new = summary.new,
                    changed = summary.changed,
                    unchanged = summary.unchanged,
                    errors = summary.errors.len(),
                    cancelled = summary.cancelled,
                    "Scrape session finished"
                );
            }
        }
    }
}

/// Reporter that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl FetchReporter for NullReporter {}
