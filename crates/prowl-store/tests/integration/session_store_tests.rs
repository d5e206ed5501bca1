use chrono::{TimeDelta, Utc};
use prowl_core::error::AppError;
use prowl_core::models::{AreaAssignment, AreaCode, CrawlMode, Session, SessionBudget, SessionStatus};
use prowl_core::traits::SessionStore;
use prowl_store::PgSessionStore;

use crate::integration::common::setup_test_db;

fn session(id: &str, areas: &[&str]) -> Session {
    Session::start(
        id,
        1,
        "2025-06-01",
        CrawlMode::Normal,
        SessionBudget {
            max_items: Some(500),
            max_runtime_minutes: 14,
        },
        areas
            .iter()
            .enumerate()
            .map(|(i, a)| AreaAssignment {
                area_code: AreaCode::from(*a),
                sequence_index: i,
            })
            .collect(),
        "firefox-win-768p",
    )
}

fn store(pool: sqlx::PgPool) -> PgSessionStore {
    PgSessionStore::new(pool, TimeDelta::days(30))
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let (pool, _container) = setup_test_db().await;
    let store = store(pool);
    let s = session("session-1", &["13101", "13102"]);

    store.create(&s).await.unwrap();

    let loaded = store.get("session-1").await.unwrap().expect("stored");
    assert_eq!(loaded, s);
    assert!(store.get("session-2").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_id_is_a_conflict() {
    let (pool, _container) = setup_test_db().await;
    let store = store(pool);

    store.create(&session("session-1", &["13101"])).await.unwrap();
    let err = store
        .create(&session("session-1", &["27100"]))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::SessionConflict(ref id) if id == "session-1"));
    // The original assignment is untouched.
    let loaded = store.get("session-1").await.unwrap().unwrap();
    assert_eq!(loaded.assigned_areas[0].area_code.as_str(), "13101");
}

#[tokio::test]
async fn checkpoint_updates_progress() {
    let (pool, _container) = setup_test_db().await;
    let store = store(pool.clone());
    let mut s = session("session-1", &["13101", "13102"]);
    store.create(&s).await.unwrap();

    s.areas_completed = 1;
    s.items_collected = 42;
    s.last_checkpoint = Some(Utc::now());
    store.checkpoint(&s).await.unwrap();

    let loaded = store.get("session-1").await.unwrap().unwrap();
    assert_eq!(loaded.areas_completed, 1);
    assert_eq!(loaded.items_collected, 42);

    let (areas, items): (i32, i64) = sqlx::query_as(
        "SELECT areas_completed, items_collected FROM crawl_sessions WHERE session_id = $1",
    )
    .bind("session-1")
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!((areas, items), (1, 42));
}

#[tokio::test]
async fn checkpoint_after_terminal_is_rejected() {
    let (pool, _container) = setup_test_db().await;
    let store = store(pool);
    let mut s = session("session-1", &["13101"]);
    store.create(&s).await.unwrap();

    s.finish(SessionStatus::Completed, None);
    store.checkpoint(&s).await.unwrap();

    s.items_collected = 99;
    let err = store.checkpoint(&s).await.unwrap_err();
    assert!(matches!(err, AppError::StoreError(ref msg) if msg.contains("already completed")));

    let loaded = store.get("session-1").await.unwrap().unwrap();
    assert_eq!(loaded.status, SessionStatus::Completed);
    assert_eq!(loaded.items_collected, 0);
}

#[tokio::test]
async fn checkpoint_cannot_change_assignment() {
    let (pool, _container) = setup_test_db().await;
    let store = store(pool);
    let s = session("session-1", &["13101", "13102"]);
    store.create(&s).await.unwrap();

    let mut moved = s.clone();
    moved.assigned_areas.reverse();
    let err = store.checkpoint(&moved).await.unwrap_err();

    assert!(matches!(err, AppError::StoreError(ref msg) if msg.contains("assignment")));
}

#[tokio::test]
async fn checkpoint_of_unknown_session_is_rejected() {
    let (pool, _container) = setup_test_db().await;
    let store = store(pool);

    let err = store
        .checkpoint(&session("ghost", &["13101"]))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::StoreError(ref msg) if msg.contains("not found")));
}

#[tokio::test]
async fn list_recent_newest_first() {
    let (pool, _container) = setup_test_db().await;
    let store = store(pool);

    for (i, id) in ["session-a", "session-b", "session-c"].iter().enumerate() {
        let mut s = session(id, &["13101"]);
        s.started_at = Utc::now() - TimeDelta::hours(3 - i as i64);
        store.create(&s).await.unwrap();
    }

    let recent = store.list_recent(2).await.unwrap();
    let ids: Vec<&str> = recent.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["session-c", "session-b"]);
}

#[tokio::test]
async fn expired_sessions_are_hidden_reusable_and_purged() {
    let (pool, _container) = setup_test_db().await;
    let store = store(pool);

    let mut old = session("session-old", &["13101"]);
    old.started_at = Utc::now() - TimeDelta::days(45);
    store.create(&old).await.unwrap();
    store.create(&session("session-new", &["13102"])).await.unwrap();

    assert!(store.get("session-old").await.unwrap().is_none());
    assert_eq!(store.list_recent(10).await.unwrap().len(), 1);

    // An expired id no longer blocks a fresh session.
    let mut reused = session("session-old", &["27100"]);
    reused.started_at = Utc::now() - TimeDelta::days(45);
    store.create(&reused).await.unwrap();

    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert_eq!(store.purge_expired().await.unwrap(), 0);
    assert!(store.get("session-new").await.unwrap().is_some());
}
