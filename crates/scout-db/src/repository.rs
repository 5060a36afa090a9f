use chrono::{DateTime, Utc};
use scout_core::error::AppError;
use scout_core::models::{ChangeRecord, ResourceFingerprint, ResourceKey};
use scout_core::traits::FingerprintStore;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Fingerprints and the change log in PostgreSQL.
#[derive(Clone)]
pub struct FingerprintRepository {
    pool: Pool<Postgres>,
}

impl FingerprintRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_fingerprint(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<ResourceFingerprint>, AppError> {
        let row = sqlx::query_as::<_, FingerprintRow>(
            r#"
            SELECT site, resource_key, content_hash, first_seen, last_seen
            FROM resource_fingerprints
            WHERE site = $1 AND resource_key = $2
            "#,
        )
        .bind(&key.site)
        .bind(&key.key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Insert or refresh a fingerprint. `first_seen` survives updates.
    pub async fn upsert_fingerprint(
        &self,
        key: &ResourceKey,
        content_hash: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<ResourceFingerprint, AppError> {
        let row = sqlx::query_as::<_, FingerprintRow>(
            r#"
            INSERT INTO resource_fingerprints (site, resource_key, content_hash, first_seen, last_seen)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (site, resource_key) DO UPDATE
            SET content_hash = EXCLUDED.content_hash,
                last_seen = EXCLUDED.last_seen
            RETURNING site, resource_key, content_hash, first_seen, last_seen
            "#,
        )
        .bind(&key.site)
        .bind(&key.key)
        .bind(content_hash)
        .bind(seen_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.into())
    }

    /// Append a change event. Returns the generated id.
    pub async fn record_change(&self, change: &ChangeRecord) -> Result<Uuid, AppError> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO resource_changes
                (site, resource_key, record_kind, outcome, previous_hash, new_hash, details, session_id, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&change.resource.site)
        .bind(&change.resource.key)
        .bind(change.record_kind.as_str())
        .bind(change.outcome.as_str())
        .bind(&change.previous_hash)
        .bind(&change.new_hash)
        .bind(&change.details)
        .bind(change.session_id)
        .bind(change.detected_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(
            resource = %change.resource,
            outcome = %change.outcome,
            "Change recorded"
        );
        Ok(row.0)
    }

    /// Change events detected at or after `since`, newest first.
    pub async fn recent_changes(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, AppError> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT site, resource_key, record_kind, outcome, previous_hash, new_hash,
                   details, session_id, detected_at
            FROM resource_changes
            WHERE detected_at >= $1
            ORDER BY detected_at DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(ChangeRecord::try_from).collect()
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct FingerprintRow {
    site: String,
    resource_key: String,
    content_hash: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl From<FingerprintRow> for ResourceFingerprint {
    fn from(row: FingerprintRow) -> Self {
        ResourceFingerprint {
            resource: ResourceKey::new(row.site, row.resource_key),
            content_hash: row.content_hash,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    site: String,
    resource_key: String,
    record_kind: String,
    outcome: String,
    previous_hash: Option<String>,
    new_hash: String,
    details: serde_json::Value,
    session_id: Uuid,
    detected_at: DateTime<Utc>,
}

impl TryFrom<ChangeRow> for ChangeRecord {
    type Error = AppError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(ChangeRecord {
            resource: ResourceKey::new(row.site, row.resource_key),
            outcome: row.outcome.parse().map_err(AppError::DatabaseError)?,
            record_kind: row.record_kind.parse().map_err(AppError::DatabaseError)?,
            previous_hash: row.previous_hash,
            new_hash: row.new_hash,
            details: row.details,
            session_id: row.session_id,
            detected_at: row.detected_at,
        })
    }
}

impl FingerprintStore for FingerprintRepository {
    async fn get_fingerprint(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<ResourceFingerprint>, AppError> {
        FingerprintRepository::get_fingerprint(self, key).await
    }

    async fn upsert_fingerprint(
        &self,
        key: &ResourceKey,
        content_hash: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<ResourceFingerprint, AppError> {
        FingerprintRepository::upsert_fingerprint(self, key, content_hash, seen_at).await
    }

    async fn record_change(&self, change: &ChangeRecord) -> Result<(), AppError> {
        FingerprintRepository::record_change(self, change)
            .await
            .map(|_| ())
    }
}
