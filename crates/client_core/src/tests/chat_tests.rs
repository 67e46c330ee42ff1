use std::sync::Arc;

use axum::{routing::get, Json, Router};
use backend_api::BackendClient;
use serde_json::{json, Value};
use storage::Storage;
use tokio::net::TcpListener;

use crate::{channel::HubChannel, chat::ChatSession};
use shared::{
    domain::{
        ApplicationId, Deal, DealId, DealStatus, Delivery, Session, UserId, UserType,
    },
    error::ClientError,
};

const PAGE_SIZE: u32 = 20;

fn test_deal() -> Deal {
    Deal {
        id: DealId(7),
        application_id: ApplicationId(3),
        advertiser_id: UserId(100),
        platform_id: UserId(200),
        status: DealStatus::InProgress,
        cost: 10_000,
    }
}

async fn spawn_rest(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn session_with_backend(base_url: &str) -> ChatSession {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_session(&Session {
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            user_id: UserId(100),
            user_type: UserType::Advertiser,
        })
        .await
        .expect("seed");
    let api = Arc::new(BackendClient::new(base_url, storage));
    // The channel stays disconnected in these tests.
    ChatSession::new(test_deal(), UserId(100), PAGE_SIZE, HubChannel::new(), api)
}

async fn offline_session() -> ChatSession {
    session_with_backend("http://127.0.0.1:9").await
}

fn history_payload(count: usize) -> Value {
    let items: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "Id": i + 1,
                "Text": format!("сообщение {}", i + 1),
                "SenderId": 200,
                "CreatedAt": format!("2026-03-01T10:{:02}:00Z", i % 60)
            })
        })
        .collect();
    json!({ "Messages": items, "TotalCount": 40 })
}

#[tokio::test]
async fn a_full_page_sets_has_more() {
    let chat = offline_session().await;
    let (page, has_more) = chat.handle_history(&history_payload(20)).await;
    assert_eq!(page, 1);
    assert!(has_more);
    assert_eq!(chat.messages().await.len(), 20);
}

#[tokio::test]
async fn a_short_page_clears_has_more() {
    let chat = offline_session().await;
    let (_, has_more) = chat.handle_history(&history_payload(5)).await;
    assert!(!has_more);
    assert_eq!(chat.messages().await.len(), 5);
}

#[tokio::test]
async fn sending_while_disconnected_fails_without_an_optimistic_entry() {
    let chat = offline_session().await;
    let err = chat.send("привет").await.expect_err("not connected");
    assert!(matches!(err, ClientError::NotConnected));
    assert!(chat.messages().await.is_empty());
}

#[tokio::test]
async fn empty_text_is_rejected_before_anything_else() {
    let chat = offline_session().await;
    let err = chat.send("   ").await.expect_err("empty");
    assert!(matches!(err, ClientError::Validation(_)));
    assert!(chat.messages().await.is_empty());
}

#[tokio::test]
async fn history_falls_back_to_rest_when_the_hub_is_down() {
    let app = Router::new().route(
        "/Messages/GetByDeal/:id",
        get(|| async { Json(history_payload(3)) }),
    );
    let base_url = spawn_rest(app).await;
    let chat = session_with_backend(&base_url).await;

    chat.load_initial().await.expect("fallback load");
    let messages = chat.messages().await;
    assert_eq!(messages.len(), 3);
    assert!(!chat.has_more().await);
    // History arrives confirmed and normalized.
    assert!(messages.iter().all(|m| m.delivery == Delivery::Confirmed));
    assert!(messages.iter().all(|m| m.deal_id == DealId(7)));
}

#[tokio::test]
async fn live_messages_for_other_deals_are_ignored() {
    let chat = offline_session().await;
    let foreign = json!({ "id": 1, "dealId": 999, "text": "чужое", "senderId": 5 });
    assert!(chat.handle_live(&foreign).await.is_none());
    assert!(chat.messages().await.is_empty());

    let ours = json!({ "id": 2, "dealId": 7, "text": "наше", "senderId": 5 });
    let absorbed = chat.handle_live(&ours).await.expect("absorbed");
    assert_eq!(absorbed.text, "наше");
    assert_eq!(chat.messages().await.len(), 1);
}

#[tokio::test]
async fn own_live_echo_marks_the_sender() {
    let chat = offline_session().await;
    let echo = json!({ "id": 3, "dealId": 7, "text": "моё", "senderId": 100 });
    let absorbed = chat.handle_live(&echo).await.expect("absorbed");
    assert!(absorbed.is_own);
}

#[tokio::test]
async fn a_closed_session_discards_late_results() {
    let chat = offline_session().await;
    chat.close().await;

    let live = json!({ "id": 1, "dealId": 7, "text": "поздно", "senderId": 5 });
    assert!(chat.handle_live(&live).await.is_none());

    chat.handle_history(&history_payload(5)).await;
    assert!(chat.messages().await.is_empty());
}

#[tokio::test]
async fn older_pages_prepend_above_the_initial_load() {
    let chat = offline_session().await;

    let recent = json!({ "Messages": [
        { "Id": 10, "Text": "новое", "SenderId": 5, "CreatedAt": "2026-03-02T10:00:00Z" }
    ]});
    chat.handle_history(&recent).await;

    // Simulate the upward page-2 load arriving from the hub.
    let older = json!([
        { "Id": 1, "Text": "старое", "SenderId": 5, "CreatedAt": "2026-03-01T10:00:00Z" }
    ]);
    let normalized: Vec<_> = {
        let (items, _) = crate::reconcile::history_items(&older);
        items
            .iter()
            .map(|item| crate::reconcile::normalize(item, DealId(7), Some(UserId(100))))
            .collect()
    };
    let merged = crate::reconcile::merge_history_page(&chat.messages().await, normalized, 2);
    assert_eq!(merged.iter().map(|m| m.id.0).collect::<Vec<_>>(), vec![1, 10]);
}
