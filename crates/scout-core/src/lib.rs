pub mod change;
pub mod circuit_breaker;
pub mod detect;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod reporter;
pub mod retry;
pub mod session;
pub mod settings;
pub mod throttle;
pub mod traits;

#[cfg(test)]
mod testutil;

pub use change::{ChangeDetector, Detection};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{AppError, ErrorKind, FailureKinds, FetchError};
pub use models::{Content, ScrapeTarget, SiteFetchConfig, TransportKind, compute_hash};
pub use orchestrator::FetchOrchestrator;
pub use reporter::{FetchEvent, FetchReporter, TracingReporter};
pub use session::{ScrapeSession, SessionConfig, SessionSummary};
pub use settings::Settings;
pub use traits::{Extractor, FingerprintStore, MemoryStore, Transport};
