use chrono::{Duration, Utc};
use scout_core::models::{ChangeOutcome, ChangeRecord, RecordKind, ResourceKey};
use scout_core::traits::FingerprintStore;
use scout_db::{Database, FingerprintRepository};
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn change(key: &ResourceKey, outcome: ChangeOutcome, new_hash: &str) -> ChangeRecord {
    ChangeRecord {
        resource: key.clone(),
        outcome,
        record_kind: RecordKind::Company,
        previous_hash: None,
        new_hash: new_hash.into(),
        details: serde_json::json!({"name": "Widgets Inc"}),
        session_id: Uuid::new_v4(),
        detected_at: Utc::now(),
    }
}

#[tokio::test]
async fn missing_fingerprint_is_none() {
    let (pool, _container) = setup_test_db().await;
    let repo = FingerprintRepository::new(pool);

    let key = ResourceKey::new("acme", "https://acme.vc/portfolio/widgets");
    assert!(repo.get_fingerprint(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn upsert_inserts_then_updates_keeping_first_seen() {
    let (pool, _container) = setup_test_db().await;
    let repo = FingerprintRepository::new(pool);
    let key = ResourceKey::new("acme", "widgets");

    let first = Utc::now() - Duration::hours(2);
    let inserted = repo.upsert_fingerprint(&key, "a".repeat(64).as_str(), first).await.unwrap();
    assert_eq!(inserted.resource, key);
    assert_eq!(inserted.first_seen.timestamp(), first.timestamp());
    assert_eq!(inserted.last_seen.timestamp(), first.timestamp());

    let later = Utc::now();
    let updated = repo.upsert_fingerprint(&key, "b".repeat(64).as_str(), later).await.unwrap();
    assert_eq!(updated.content_hash, "b".repeat(64));
    assert_eq!(updated.first_seen.timestamp(), first.timestamp());
    assert_eq!(updated.last_seen.timestamp(), later.timestamp());

    let stored = repo.get_fingerprint(&key).await.unwrap().expect("fingerprint stored");
    assert_eq!(stored.content_hash, "b".repeat(64));
}

#[tokio::test]
async fn fingerprints_are_scoped_by_site() {
    let (pool, _container) = setup_test_db().await;
    let repo = FingerprintRepository::new(pool);

    let now = Utc::now();
    repo.upsert_fingerprint(&ResourceKey::new("acme", "team"), "h1", now).await.unwrap();
    repo.upsert_fingerprint(&ResourceKey::new("globex", "team"), "h2", now).await.unwrap();

    let acme = repo.get_fingerprint(&ResourceKey::new("acme", "team")).await.unwrap().unwrap();
    let globex = repo.get_fingerprint(&ResourceKey::new("globex", "team")).await.unwrap().unwrap();
    assert_eq!(acme.content_hash, "h1");
    assert_eq!(globex.content_hash, "h2");
}

#[tokio::test]
async fn record_change_and_list_recent() {
    let (pool, _container) = setup_test_db().await;
    let repo = FingerprintRepository::new(pool);
    let key = ResourceKey::new("acme", "widgets");

    let mut older = change(&key, ChangeOutcome::New, "h1");
    older.detected_at = Utc::now() - Duration::hours(1);
    repo.record_change(&older).await.unwrap();

    let mut newer = change(&key, ChangeOutcome::Changed, "h2");
    newer.previous_hash = Some("h1".into());
    let id = repo.record_change(&newer).await.unwrap();
    assert!(!id.is_nil());

    let changes = repo
        .recent_changes(Utc::now() - Duration::hours(24), 10)
        .await
        .unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].outcome, ChangeOutcome::Changed);
    assert_eq!(changes[0].previous_hash.as_deref(), Some("h1"));
    assert_eq!(changes[0].record_kind, RecordKind::Company);
    assert_eq!(changes[0].details, serde_json::json!({"name": "Widgets Inc"}));
    assert_eq!(changes[1].outcome, ChangeOutcome::New);
}

#[tokio::test]
async fn recent_changes_respects_window_and_limit() {
    let (pool, _container) = setup_test_db().await;
    let repo = FingerprintRepository::new(pool);

    let mut stale = change(&ResourceKey::new("acme", "old"), ChangeOutcome::New, "h0");
    stale.detected_at = Utc::now() - Duration::days(3);
    repo.record_change(&stale).await.unwrap();

    for i in 0..3 {
        let key = ResourceKey::new("acme", format!("r{i}"));
        repo.record_change(&change(&key, ChangeOutcome::New, "h")).await.unwrap();
    }

    let since = Utc::now() - Duration::hours(24);
    assert_eq!(repo.recent_changes(since, 10).await.unwrap().len(), 3);
    assert_eq!(repo.recent_changes(since, 2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn repository_works_through_store_trait() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);
    let store = db.fingerprints();
    let key = ResourceKey::new("acme", "deal");

    FingerprintStore::upsert_fingerprint(&store, &key, "h1", Utc::now()).await.unwrap();
    FingerprintStore::record_change(&store, &change(&key, ChangeOutcome::New, "h1"))
        .await
        .unwrap();

    let fp = FingerprintStore::get_fingerprint(&store, &key).await.unwrap().unwrap();
    assert_eq!(fp.content_hash, "h1");
    store.health_check().await.unwrap();
}
