//! Content normalization and fingerprint comparison.
//!
//! Fetched content carries noise that changes on every request: render
//! timestamps, HTML comments with build ids, cache-buster query strings.
//! The detector strips that noise before hashing so a fingerprint only moves
//! when the substance does.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::models::{ChangeOutcome, ResourceFingerprint, ResourceKey, compute_hash};
use crate::traits::FingerprintStore;

static HTML_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--.*?-->").expect("invalid comment regex")
});

static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("invalid timestamp regex")
});

static CLOCK_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d{1,2}:\d{2}(?::\d{2})?(?:\s?[ap]m)?\b")
        .expect("invalid clock regex")
});

static CACHE_BUSTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([?&])(?:_|cb|ts|timestamp|nocache|cachebuster)=[\w.-]*(&?)")
        .expect("invalid cache-buster regex")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("invalid space regex"));

/// Keeps the separator only when another parameter follows, so
/// `?cb=1&page=2` becomes `?page=2` and a trailing `?cb=1` disappears.
fn strip_cache_buster(caps: &Captures) -> String {
    if caps[2].is_empty() {
        String::new()
    } else {
        caps[1].to_string()
    }
}

/// Keys that change on every scrape and never signal a real change.
const VOLATILE_KEYS: &[&str] = &["scraped_at", "fetched_at", "last_seen", "content_hash"];

/// Result of checking one record against its stored fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub outcome: ChangeOutcome,
    pub hash: String,
    pub previous: Option<String>,
    /// The record as it was hashed.
    pub normalized: Value,
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    volatile_keys: Vec<String>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self {
            volatile_keys: VOLATILE_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also ignore `key` wherever it appears in a record.
    pub fn with_volatile_key(mut self, key: impl Into<String>) -> Self {
        self.volatile_keys.push(key.into());
        self
    }

    pub fn normalize_text(text: &str) -> String {
        let text = HTML_COMMENT.replace_all(text, " ");
        let text = ISO_TIMESTAMP.replace_all(&text, "");
        let text = CLOCK_TIME.replace_all(&text, "");
        let text = CACHE_BUSTER.replace_all(&text, strip_cache_buster);
        let text = WHITESPACE.replace_all(&text, " ");
        text.trim().to_string()
    }

    /// Normalizes every string, drops volatile keys and sorts object keys.
    pub fn normalize_record(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(Self::normalize_text(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.normalize_record(v)).collect())
            }
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map
                    .iter()
                    .filter(|(k, _)| !self.volatile_keys.iter().any(|v| v == *k))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));

                let mut out = Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), self.normalize_record(v));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Hex SHA-256 of the canonical form of `value`.
    pub fn fingerprint(&self, value: &Value) -> Result<(Value, String), AppError> {
        let normalized = self.normalize_record(value);
        let canonical = serde_json::to_string(&normalized)?;
        let hash = compute_hash(&canonical);
        Ok((normalized, hash))
    }

    pub fn fingerprint_text(text: &str) -> String {
        compute_hash(&Self::normalize_text(text))
    }

    pub fn compare(previous: Option<&ResourceFingerprint>, hash: &str) -> ChangeOutcome {
        match previous {
            None => ChangeOutcome::New,
            Some(fp) if fp.content_hash == hash => ChangeOutcome::Unchanged,
            Some(_) => ChangeOutcome::Changed,
        }
    }

    /// Reads the prior fingerprint for `key` and classifies `record`.
    ///
    /// Never writes; persisting on `New` or `Changed` is up to the caller.
    pub async fn detect<S: FingerprintStore>(
        &self,
        store: &S,
        key: &ResourceKey,
        record: &Value,
    ) -> Result<Detection, AppError> {
        let (normalized, hash) = self.fingerprint(record)?;
        let previous = store.get_fingerprint(key).await?;
        let outcome = Self::compare(previous.as_ref(), &hash);

        tracing::debug!(resource = %key, %outcome, "Change detection");

        Ok(Detection {
            outcome,
            hash,
            previous: previous.map(|fp| fp.content_hash),
            normalized,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::traits::MemoryStore;

    #[test]
    fn test_normalize_strips_timestamps_and_comments() {
        let a = "<p>Portfolio</p><!-- build 8812 -->  updated 2024-03-01T10:15:00Z at 10:15 AM";
        let b = "<p>Portfolio</p><!-- build 9001 -->\n updated 2025-11-20T08:00:12.123+01:00 at 8:00 pm";
        assert_eq!(
            ChangeDetector::normalize_text(a),
            ChangeDetector::normalize_text(b)
        );
    }

    #[test]
    fn test_normalize_strips_cache_busters() {
        let a = "https://acme.vc/logo.png?cb=1700000000";
        let b = "https://acme.vc/logo.png?cb=1800000000";
        assert_eq!(
            ChangeDetector::normalize_text(a),
            ChangeDetector::normalize_text(b)
        );
        assert_eq!(ChangeDetector::normalize_text(a), "https://acme.vc/logo.png");
    }

    #[test]
    fn test_normalize_keeps_real_query_params() {
        let text = "https://acme.vc/companies?page=2&ts=99";
        assert_eq!(
            ChangeDetector::normalize_text(text),
            "https://acme.vc/companies?page=2"
        );
    }

    #[test]
    fn test_normalize_keeps_params_after_cache_buster() {
        assert_eq!(
            ChangeDetector::normalize_text("https://acme.vc/team?_=17&page=3"),
            "https://acme.vc/team?page=3"
        );
    }

    #[test]
    fn test_normalize_keeps_trailing_punctuation() {
        assert_eq!(ChangeDetector::normalize_text("Is AI a bubble?"), "Is AI a bubble?");
        assert_eq!(ChangeDetector::normalize_text("R&"), "R&");
    }

    #[tokio::test]
    async fn test_added_question_mark_is_a_change() {
        let detector = ChangeDetector::new();
        let store = MemoryStore::new();
        let key = ResourceKey::new("news", "https://news.vc/ai-bubble");

        let first = detector
            .detect(&store, &key, &json!({"title": "Is AI a bubble"}))
            .await
            .unwrap();
        store
            .upsert_fingerprint(&key, &first.hash, Utc::now())
            .await
            .unwrap();

        let second = detector
            .detect(&store, &key, &json!({"title": "Is AI a bubble?"}))
            .await
            .unwrap();
        assert_eq!(second.outcome, ChangeOutcome::Changed);
    }

    #[test]
    fn test_record_hash_ignores_volatile_fields_and_key_order() {
        let detector = ChangeDetector::new();
        let a = json!({"name": "Acme", "sector": "fintech", "scraped_at": "2024-01-01"});
        let b = json!({"scraped_at": "2025-06-30", "sector": "fintech", "name": "Acme"});

        let (_, ha) = detector.fingerprint(&a).unwrap();
        let (_, hb) = detector.fingerprint(&b).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(ha.len(), 64);
    }

    #[test]
    fn test_record_hash_tracks_real_changes() {
        let detector = ChangeDetector::new();
        let (_, before) = detector
            .fingerprint(&json!({"name": "Acme", "status": "active"}))
            .unwrap();
        let (_, after) = detector
            .fingerprint(&json!({"name": "Acme", "status": "exited"}))
            .unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_nested_volatile_keys_are_dropped() {
        let detector = ChangeDetector::new();
        let normalized =
            detector.normalize_record(&json!({"team": [{"name": "Ada", "last_seen": "x"}]}));
        assert_eq!(normalized, json!({"team": [{"name": "Ada"}]}));
    }

    #[test]
    fn test_custom_volatile_key() {
        let detector = ChangeDetector::new().with_volatile_key("view_count");
        let (_, a) = detector
            .fingerprint(&json!({"name": "Acme", "view_count": 1}))
            .unwrap();
        let (_, b) = detector
            .fingerprint(&json!({"name": "Acme", "view_count": 2}))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_compare_outcomes() {
        let fp = ResourceFingerprint {
            resource: ResourceKey::new("acme", "k"),
            content_hash: "abc".into(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        };
        assert_eq!(ChangeDetector::compare(None, "abc"), ChangeOutcome::New);
        assert_eq!(
            ChangeDetector::compare(Some(&fp), "abc"),
            ChangeOutcome::Unchanged
        );
        assert_eq!(
            ChangeDetector::compare(Some(&fp), "def"),
            ChangeOutcome::Changed
        );
    }

    #[tokio::test]
    async fn test_detect_sequence_new_unchanged_changed() {
        let detector = ChangeDetector::new();
        let store = MemoryStore::new();
        let key = ResourceKey::new("acme", "https://acme.vc/portfolio/widgets");
        let v1 = json!({"name": "Widgets Inc", "fetched_at": "2024-01-01T00:00:00Z"});
        let v1_later = json!({"name": "Widgets Inc", "fetched_at": "2024-02-01T00:00:00Z"});
        let v2 = json!({"name": "Widgets Inc", "stage": "Series B"});

        let first = detector.detect(&store, &key, &v1).await.unwrap();
        assert_eq!(first.outcome, ChangeOutcome::New);
        assert!(first.previous.is_none());
        store
            .upsert_fingerprint(&key, &first.hash, Utc::now())
            .await
            .unwrap();

        let second = detector.detect(&store, &key, &v1_later).await.unwrap();
        assert_eq!(second.outcome, ChangeOutcome::Unchanged);

        let third = detector.detect(&store, &key, &v2).await.unwrap();
        assert_eq!(third.outcome, ChangeOutcome::Changed);
        assert_eq!(third.previous.as_deref(), Some(first.hash.as_str()));
    }

    #[tokio::test]
    async fn test_same_content_under_different_keys_is_independent() {
        let detector = ChangeDetector::new();
        let store = MemoryStore::new();
        let record = json!({"name": "Shared Co"});
        let a = ResourceKey::new("fund-a", "shared-co");
        let b = ResourceKey::new("fund-b", "shared-co");

        let first = detector.detect(&store, &a, &record).await.unwrap();
        store
            .upsert_fingerprint(&a, &first.hash, Utc::now())
            .await
            .unwrap();

        let other = detector.detect(&store, &b, &record).await.unwrap();
        assert_eq!(other.outcome, ChangeOutcome::New);
        assert_eq!(other.hash, first.hash);
    }

    #[tokio::test]
    async fn test_detect_never_writes() {
        let detector = ChangeDetector::new();
        let store = MemoryStore::new();
        let key = ResourceKey::new("acme", "k");

        detector.detect(&store, &key, &json!({"a": 1})).await.unwrap();

        assert_eq!(store.fingerprint_count(), 0);
        assert!(store.changes().is_empty());
    }
}
