//! Per-site request spacing for polite fetching.
//!
//! Every attempt, first tries and retries alike, waits here before touching
//! the network. The delay is keyed by origin (scheme + host + port), so a
//! slow site never blocks fetches to other sites.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FetchError;

/// Tracks the next permitted request instant per origin.
#[derive(Clone, Default)]
pub struct SiteThrottle {
    jitter: bool,
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl SiteThrottle {
    /// Throttle that scales each delay by a random factor in [0.5, 1.5).
    pub fn new() -> Self {
        Self {
            jitter: true,
            next_slot: Arc::default(),
        }
    }

    /// Throttle with exact spacing, mainly for tests.
    pub fn without_jitter() -> Self {
        Self {
            jitter: false,
            next_slot: Arc::default(),
        }
    }

    /// Extract the origin key from a URL (scheme://host:port).
    pub fn domain_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        let port = url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!("{}://{}{}", url.scheme(), host, port))
    }

    fn effective_delay(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(rand::random_range(0.5..1.5))
    }

    /// Waits until `url`'s origin may be contacted again, then reserves the
    /// following slot `delay` later.
    ///
    /// The slot is reserved under the lock and the sleep happens after
    /// releasing it, so concurrent callers for one origin queue up behind
    /// each other while other origins proceed.
    pub async fn wait(
        &self,
        url: &str,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let Some(domain) = Self::domain_key(url) else {
            return Ok(());
        };

        let now = Instant::now();
        let start = {
            let mut slots = self.next_slot.lock().await;
            let start = slots.get(&domain).copied().unwrap_or(now).max(now);
            slots.insert(domain.clone(), start + self.effective_delay(delay));
            start
        };

        if start <= now {
            return Ok(());
        }

        tracing::debug!(
            domain = %domain,
            sleep_ms = %(start - now).as_millis(),
            "Throttling request"
        );

        tokio::select! {
            () = tokio::time::sleep_until(start) => Ok(()),
            () = cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }
}
