use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AppError, FetchError};
use crate::models::{
    ChangeRecord, Content, ExtractedRecord, ResourceFingerprint, ResourceKey, ScrapeTarget,
    TransportKind,
};

/// Performs a single fetch attempt. Retries, breakers and throttling live
/// above this layer.
pub trait Transport: Send + Sync + Clone {
    fn kind(&self) -> TransportKind;

    fn fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Content, FetchError>> + Send;
}

/// Stand-in for a transport that was not compiled into this build.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableTransport {
    kind: TransportKind,
}

impl UnavailableTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self { kind }
    }
}

impl Transport for UnavailableTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn fetch(&self, _url: &str, _timeout: Duration) -> Result<Content, FetchError> {
        Err(FetchError::TransportUnavailable(self.kind))
    }
}

/// Turns fetched content into structured records.
pub trait Extractor: Send + Sync + Clone {
    fn extract(
        &self,
        target: &ScrapeTarget,
        content: &Content,
    ) -> Result<Vec<ExtractedRecord>, AppError>;
}

/// Persists fingerprints and change events.
pub trait FingerprintStore: Send + Sync + Clone {
    fn get_fingerprint(
        &self,
        key: &ResourceKey,
    ) -> impl Future<Output = Result<Option<ResourceFingerprint>, AppError>> + Send;

    /// Insert or replace the fingerprint for `key`. `first_seen` is kept on
    /// update.
    fn upsert_fingerprint(
        &self,
        key: &ResourceKey,
        content_hash: &str,
        seen_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<ResourceFingerprint, AppError>> + Send;

    fn record_change(
        &self,
        change: &ChangeRecord,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// In-process store for tests and database-less dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    fingerprints: Arc<Mutex<HashMap<ResourceKey, ResourceFingerprint>>>,
    changes: Arc<Mutex<Vec<ChangeRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<ChangeRecord> {
        self.changes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn fingerprint_count(&self) -> usize {
        self.fingerprints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

impl FingerprintStore for MemoryStore {
    async fn get_fingerprint(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<ResourceFingerprint>, AppError> {
        let map = self.fingerprints.lock().unwrap_or_else(|p| p.into_inner());
        Ok(map.get(key).cloned())
    }

    async fn upsert_fingerprint(
        &self,
        key: &ResourceKey,
        content_hash: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<ResourceFingerprint, AppError> {
        let mut map = self.fingerprints.lock().unwrap_or_else(|p| p.into_inner());
        let entry = map
            .entry(key.clone())
            .and_modify(|fp| {
                fp.content_hash = content_hash.to_string();
                fp.last_seen = seen_at;
            })
            .or_insert_with(|| ResourceFingerprint {
                resource: key.clone(),
                content_hash: content_hash.to_string(),
                first_seen: seen_at,
                last_seen: seen_at,
            });
        Ok(entry.clone())
    }

    async fn record_change(&self, change: &ChangeRecord) -> Result<(), AppError> {
        self.changes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(change.clone());
        Ok(())
    }
}
