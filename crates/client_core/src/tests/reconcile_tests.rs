use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::reconcile::*;
use shared::domain::{DealId, Delivery, Message, MessageId, UserId};

const DEAL: DealId = DealId(7);
const ME: UserId = UserId(100);

fn message(id: i64, secs: i64, text: &str) -> Message {
    Message {
        id: MessageId(id),
        deal_id: DEAL,
        text: text.into(),
        sender_id: UserId(1),
        sender_name: Some("Аня".into()),
        timestamp: Utc.timestamp_opt(secs, 0).single().expect("timestamp"),
        is_own: false,
        is_system: false,
        delivery: Delivery::Confirmed,
    }
}

#[test]
fn normalize_applies_field_precedence_across_casings() {
    let raw = json!({
        "MessageId": 5,
        "Text": "привет",
        "SenderId": 100,
        "SenderName": "Аня",
        "CreatedAt": "2026-03-01T12:30:00Z",
        "IsSystem": false
    });
    let normalized = normalize(&raw, DEAL, Some(ME));
    assert_eq!(normalized.id, MessageId(5));
    assert_eq!(normalized.text, "привет");
    assert_eq!(normalized.sender_id, ME);
    assert!(normalized.is_own);
    assert_eq!(normalized.deal_id, DEAL);

    // Lowercase keys win over their PascalCase twins when both appear.
    let raw = json!({
        "id": 1,
        "Id": 2,
        "text": "верхний",
        "Message": "нижний",
        "senderId": 9,
        "UserId": 10
    });
    let normalized = normalize(&raw, DEAL, Some(ME));
    assert_eq!(normalized.id, MessageId(1));
    assert_eq!(normalized.text, "верхний");
    assert_eq!(normalized.sender_id, UserId(9));
    assert!(!normalized.is_own);
}

#[test]
fn normalize_unwraps_a_message_envelope_but_keeps_string_message_as_text() {
    let nested = json!({
        "message": { "id": 3, "text": "вложенный", "senderId": 2 }
    });
    let normalized = normalize(&nested, DEAL, Some(ME));
    assert_eq!(normalized.id, MessageId(3));
    assert_eq!(normalized.text, "вложенный");

    let flat = json!({ "id": 4, "Message": "строка", "senderId": 2 });
    let normalized = normalize(&flat, DEAL, Some(ME));
    assert_eq!(normalized.text, "строка");
}

#[test]
fn normalize_synthesizes_an_id_from_the_timestamp() {
    let raw = json!({
        "text": "без id",
        "senderId": 2,
        "timestamp": "2026-03-01T12:30:00Z"
    });
    let normalized = normalize(&raw, DEAL, Some(ME));
    let expected = Utc
        .with_ymd_and_hms(2026, 3, 1, 12, 30, 0)
        .single()
        .expect("timestamp");
    assert_eq!(normalized.id, MessageId(expected.timestamp_millis()));
    assert_eq!(normalized.timestamp, expected);
}

#[test]
fn normalize_accepts_offsetless_timestamps_and_string_ids() {
    let raw = json!({
        "id": "17",
        "text": "ok",
        "senderId": "100",
        "createdAt": "2026-03-01T12:30:00.250"
    });
    let normalized = normalize(&raw, DEAL, Some(ME));
    assert_eq!(normalized.id, MessageId(17));
    assert_eq!(normalized.sender_id, ME);
    assert_eq!(normalized.timestamp.timestamp_subsec_millis(), 250);
}

#[test]
fn normalize_is_idempotent_over_its_own_output() {
    let variants = [
        json!({
            "Id": 11,
            "Text": "раз",
            "UserId": 100,
            "UserName": "Аня",
            "SentAt": "2026-03-01T09:00:00Z",
            "IsSystem": true
        }),
        json!({
            "messageId": 12,
            "message": "два",
            "senderId": 3,
            "date": "2026-03-01T10:00:00+03:00"
        }),
        json!({ "text": "без даты и id", "senderId": 4 }),
    ];

    for raw in variants {
        let once = normalize(&raw, DEAL, Some(ME));
        let reserialized = serde_json::to_value(&once).expect("serialize");
        let twice = normalize(&reserialized, DEAL, Some(ME));
        assert_eq!(once, twice);
    }
}

#[test]
fn history_items_unwraps_every_observed_shape() {
    let bare = json!([{ "id": 1 }, { "id": 2 }]);
    let (items, total) = history_items(&bare);
    assert_eq!(items.len(), 2);
    assert_eq!(total, None);

    let wrapped = json!({ "Messages": [{ "id": 1 }], "TotalCount": 40 });
    let (items, total) = history_items(&wrapped);
    assert_eq!(items.len(), 1);
    assert_eq!(total, Some(40));

    let lowercase = json!({ "messages": [{ "id": 1 }, { "id": 2 }, { "id": 3 }] });
    let (items, _) = history_items(&lowercase);
    assert_eq!(items.len(), 3);

    let (items, total) = history_items(&json!({ "unrelated": true }));
    assert!(items.is_empty());
    assert_eq!(total, None);
}

#[test]
fn merged_pages_stay_sorted_and_free_of_duplicates() {
    // Page 1 arrives shuffled; the server ordering is never trusted.
    let page1 = vec![message(3, 300, "c"), message(1, 100, "a"), message(2, 200, "b")];
    let merged = merge_history_page(&[], page1, 1);
    assert_eq!(
        merged.iter().map(|m| m.id.0).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // Page 2 prepends older messages and overlaps with page 1.
    let page2 = vec![message(0, 50, "старое"), message(1, 100, "a")];
    let merged = merge_history_page(&merged, page2, 2);
    assert_eq!(
        merged.iter().map(|m| m.id.0).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    let timestamps: Vec<_> = merged.iter().map(|m| m.timestamp).collect();
    let mut sorted = timestamps.clone();
    sorted.sort();
    assert_eq!(timestamps, sorted);
}

#[test]
fn page_one_replaces_the_existing_set() {
    let existing = vec![message(1, 100, "old"), message(2, 200, "old")];
    let merged = merge_history_page(&existing, vec![message(9, 900, "fresh")], 1);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].id, MessageId(9));
}

#[test]
fn a_confirmed_copy_wins_over_a_pending_one_in_a_merge() {
    let mut pending = message(5, 500, "жду");
    pending.delivery = Delivery::Pending;
    let confirmed = message(5, 500, "жду");

    let merged = merge_history_page(&[pending], vec![confirmed], 2);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].delivery, Delivery::Confirmed);
}

#[test]
fn absorb_live_replaces_a_matching_optimistic_message() {
    let mut optimistic = message(999_000, 1000, "привет");
    optimistic.sender_id = ME;
    optimistic.is_own = true;
    optimistic.delivery = Delivery::Pending;

    let mut echoed = message(42, 1010, "привет");
    echoed.sender_id = ME;
    echoed.is_own = true;

    let absorbed = absorb_live(vec![optimistic], echoed);
    assert_eq!(absorbed.len(), 1);
    assert_eq!(absorbed[0].id, MessageId(42));
    assert_eq!(absorbed[0].delivery, Delivery::Confirmed);
}

#[test]
fn absorb_live_keeps_messages_outside_the_match_window() {
    let mut old_own = message(1, 1000, "привет");
    old_own.sender_id = ME;
    old_own.is_own = true;

    let mut fresh = message(2, 1000 + 600, "привет");
    fresh.sender_id = ME;
    fresh.is_own = true;

    let absorbed = absorb_live(vec![old_own], fresh);
    assert_eq!(absorbed.len(), 2);
}

#[test]
fn absorb_live_appends_in_arrival_order_and_dedupes_ids() {
    let list = absorb_live(vec![message(1, 500, "a")], message(2, 100, "раньше, но позже пришло"));
    // Arrival order is preserved; no re-sort against in-flight pages.
    assert_eq!(list.iter().map(|m| m.id.0).collect::<Vec<_>>(), vec![1, 2]);

    let deduped = absorb_live(list, message(2, 100, "раньше, но позже пришло"));
    assert_eq!(deduped.len(), 2);
}

#[test]
fn group_by_date_buckets_by_local_calendar_day() {
    let morning = message(1, 1_767_225_600, "утро"); // 2026-01-01 00:00 UTC
    let evening = message(2, 1_767_268_800, "вечер"); // same UTC day, 12:00
    let next_day = message(3, 1_767_312_000, "завтра"); // 2026-01-02 00:00 UTC

    let groups = group_by_date(&[morning, evening, next_day]);
    assert!(groups.len() >= 2);
    let total: usize = groups.values().map(Vec::len).sum();
    assert_eq!(total, 3);

    // Days come out in ascending order.
    let days: Vec<_> = groups.keys().collect();
    let mut sorted = days.clone();
    sorted.sort();
    assert_eq!(days, sorted);
}
