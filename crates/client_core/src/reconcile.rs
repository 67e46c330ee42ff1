//! Normalizes the backend's inconsistently-cased message payloads into
//! canonical [`Message`] records and merges history pages with live
//! traffic. Pure functions, no I/O; raw payload shapes stop here.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use shared::domain::{DealId, Delivery, Message, MessageId, UserId};

/// Per-field precedence over every casing the backend has been seen to
/// emit. First present wins.
const ID_KEYS: &[&str] = &["id", "Id", "messageId", "MessageId"];
const TEXT_KEYS: &[&str] = &["text", "Text", "message", "Message"];
const SENDER_ID_KEYS: &[&str] = &["senderId", "SenderId", "userId", "UserId"];
const SENDER_NAME_KEYS: &[&str] = &["senderName", "SenderName", "userName", "UserName", "name", "Name"];
const TIMESTAMP_KEYS: &[&str] = &[
    "timestamp",
    "Timestamp",
    "createdAt",
    "CreatedAt",
    "sentAt",
    "SentAt",
    "date",
    "Date",
];
const SYSTEM_KEYS: &[&str] = &["isSystem", "IsSystem"];
const DEAL_ID_KEYS: &[&str] = &["dealId", "DealId"];
const HISTORY_LIST_KEYS: &[&str] = &["Messages", "messages", "Items", "items"];
const HISTORY_COUNT_KEYS: &[&str] = &["TotalCount", "totalCount"];

/// A confirmed copy replaces a local optimistic one when content matches
/// and the timestamps are at most this far apart.
const CONTENT_MATCH_WINDOW_SECS: i64 = 120;

pub fn normalize(raw: &Value, deal_id: DealId, own_user_id: Option<UserId>) -> Message {
    // Some payloads nest the record under a "message" envelope. Only an
    // object counts; a string "message" field is a text candidate.
    let body = raw
        .get("message")
        .or_else(|| raw.get("Message"))
        .filter(|value| value.is_object())
        .unwrap_or(raw);

    let timestamp = first_value(body, TIMESTAMP_KEYS)
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);
    let id = first_i64(body, ID_KEYS)
        .map(MessageId)
        .unwrap_or_else(|| MessageId(timestamp.timestamp_millis()));
    let sender_id = first_i64(body, SENDER_ID_KEYS).map(UserId).unwrap_or(UserId(0));

    Message {
        id,
        deal_id: first_i64(body, DEAL_ID_KEYS).map(DealId).unwrap_or(deal_id),
        text: first_str(body, TEXT_KEYS).unwrap_or_default(),
        sender_id,
        sender_name: first_str(body, SENDER_NAME_KEYS),
        timestamp,
        is_own: own_user_id == Some(sender_id),
        is_system: first_bool(body, SYSTEM_KEYS).unwrap_or(false),
        delivery: Delivery::Confirmed,
    }
}

/// Unwraps the varying `MessageHistory` payload shapes: a bare array, or
/// an object carrying the list (and sometimes a total count).
pub fn history_items(payload: &Value) -> (Vec<Value>, Option<i64>) {
    if let Some(items) = payload.as_array() {
        return (items.clone(), None);
    }
    let items = HISTORY_LIST_KEYS
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_array))
        .cloned()
        .unwrap_or_default();
    let total = HISTORY_COUNT_KEYS
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_i64));
    (items, total)
}

/// Page 1 replaces the whole set (initial load); later pages prepend
/// (older messages load upward). The result is sorted ascending by
/// timestamp and free of duplicate ids — server ordering is never trusted.
pub fn merge_history_page(
    existing: &[Message],
    page: Vec<Message>,
    page_number: u32,
) -> Vec<Message> {
    let mut combined: Vec<Message> = if page_number <= 1 {
        page
    } else {
        page.into_iter().chain(existing.iter().cloned()).collect()
    };
    combined.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    dedupe_by_id(combined)
}

/// Appends a live message in arrival order. A confirmed copy of an own
/// optimistic message (same deal, sender and text, timestamps within the
/// match window) replaces it instead of duplicating; a known id is
/// dropped.
pub fn absorb_live(mut messages: Vec<Message>, incoming: Message) -> Vec<Message> {
    if incoming.is_own {
        if let Some(existing) = messages.iter_mut().find(|m| {
            m.is_own
                && m.id != incoming.id
                && m.deal_id == incoming.deal_id
                && m.sender_id == incoming.sender_id
                && m.text == incoming.text
                && m.delivery != Delivery::Failed
                && (m.timestamp - incoming.timestamp)
                    .num_seconds()
                    .abs()
                    <= CONTENT_MATCH_WINDOW_SECS
        }) {
            *existing = incoming;
            return messages;
        }
    }

    if messages
        .iter()
        .any(|m| m.id == incoming.id && m.delivery != Delivery::Pending)
    {
        return messages;
    }
    messages.push(incoming);
    messages
}

/// Ordered mapping from local calendar day to that day's messages, for
/// date separators. Order inside a day is the input order.
pub fn group_by_date(messages: &[Message]) -> BTreeMap<NaiveDate, Vec<Message>> {
    let mut groups: BTreeMap<NaiveDate, Vec<Message>> = BTreeMap::new();
    for message in messages {
        let day = message.timestamp.with_timezone(&Local).date_naive();
        groups.entry(day).or_default().push(message.clone());
    }
    groups
}

fn dedupe_by_id(combined: Vec<Message>) -> Vec<Message> {
    let mut kept_at: HashMap<MessageId, usize> = HashMap::new();
    let mut result: Vec<Message> = Vec::with_capacity(combined.len());
    for message in combined {
        match kept_at.get(&message.id) {
            Some(&index) => {
                // A confirmed copy wins over a lingering optimistic one.
                if result[index].delivery == Delivery::Pending
                    && message.delivery == Delivery::Confirmed
                {
                    result[index] = message;
                }
            }
            None => {
                kept_at.insert(message.id, result.len());
                result.push(message);
            }
        }
    }
    result
}

fn first_value<'a>(body: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| {
        body.get(key)
            .filter(|value| !value.is_null())
    })
}

fn first_str(body: &Value, keys: &[&str]) -> Option<String> {
    first_value(body, keys)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn first_i64(body: &Value, keys: &[&str]) -> Option<i64> {
    first_value(body, keys).and_then(|value| {
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
    })
}

fn first_bool(body: &Value, keys: &[&str]) -> Option<bool> {
    first_value(body, keys).and_then(Value::as_bool)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // The backend sometimes omits the offset; those stamps are UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
