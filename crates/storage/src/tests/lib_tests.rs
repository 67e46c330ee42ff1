use super::*;
use shared::domain::UserType;

fn sample_session() -> Session {
    Session {
        access_token: "access-1".into(),
        refresh_token: "refresh-1".into(),
        user_id: UserId(42),
        user_type: UserType::Advertiser,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn session_round_trips_and_mirrors_access_token() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage.load_session().await.expect("load").is_none());

    storage
        .save_session(&sample_session())
        .await
        .expect("save");

    let loaded = storage.load_session().await.expect("load").expect("some");
    assert_eq!(loaded.user_id, UserId(42));
    assert_eq!(loaded.access_token, "access-1");
    assert_eq!(
        storage.access_token().await.expect("token").as_deref(),
        Some("access-1")
    );
}

#[tokio::test]
async fn set_tokens_rotates_both_rows() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_session(&sample_session())
        .await
        .expect("save");

    storage
        .set_tokens("access-2", "refresh-2")
        .await
        .expect("rotate");

    let loaded = storage.load_session().await.expect("load").expect("some");
    assert_eq!(loaded.access_token, "access-2");
    assert_eq!(loaded.refresh_token, "refresh-2");
    assert_eq!(
        storage.access_token().await.expect("token").as_deref(),
        Some("access-2")
    );
}

#[tokio::test]
async fn set_tokens_requires_a_stored_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .set_tokens("access", "refresh")
        .await
        .expect_err("no session stored");
}

#[tokio::test]
async fn clear_session_removes_both_keys() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_session(&sample_session())
        .await
        .expect("save");

    storage.clear_session().await.expect("clear");

    assert!(storage.load_session().await.expect("load").is_none());
    assert!(storage.access_token().await.expect("token").is_none());
}

#[tokio::test]
async fn transfer_intent_lifecycle() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let intent = storage
        .record_transfer_intent(DealId(7), UserId(1), UserId(2), 10_000)
        .await
        .expect("record");
    assert_eq!(intent.state, IntentState::Pending);

    let pending = storage.pending_transfer_intents().await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].intent_id, intent.intent_id);
    assert_eq!(pending[0].amount, 10_000);

    storage
        .mark_transfer_settled(intent.intent_id)
        .await
        .expect("settle");
    assert!(storage
        .pending_transfer_intents()
        .await
        .expect("pending")
        .is_empty());
}

#[tokio::test]
async fn failed_intents_leave_the_pending_list() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let intent = storage
        .record_transfer_intent(DealId(7), UserId(1), UserId(2), 500)
        .await
        .expect("record");

    storage
        .mark_transfer_failed(intent.intent_id)
        .await
        .expect("fail");
    assert!(storage
        .pending_transfer_intents()
        .await
        .expect("pending")
        .is_empty());
}

#[tokio::test]
async fn finishing_an_unknown_intent_errors() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .mark_transfer_settled(Uuid::new_v4())
        .await
        .expect_err("unknown intent");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("deal_chat_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("client.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    storage.health_check().await.expect("health check");
    assert!(db_path.exists());

    drop(storage);
    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
