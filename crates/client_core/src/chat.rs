//! Per-deal chat state: history paging, live absorption, and the
//! optimistic send lifecycle.

use std::sync::Arc;

use backend_api::BackendClient;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use shared::{
    domain::{Deal, Delivery, Message, MessageId, UserId},
    error::ClientError,
};

use crate::{
    channel::{ChannelState, HubChannel},
    reconcile,
};

pub struct ChatSession {
    deal: Deal,
    own_user_id: UserId,
    page_size: u32,
    channel: Arc<HubChannel>,
    api: Arc<BackendClient>,
    state: Mutex<ChatState>,
}

#[derive(Default)]
struct ChatState {
    messages: Vec<Message>,
    has_more: bool,
    /// Hub page whose response has not arrived yet; re-issued after a
    /// reconnect because the channel keeps no in-flight state.
    inflight_page: Option<u32>,
    last_loaded_page: u32,
    closed: bool,
}

impl ChatSession {
    pub fn new(
        deal: Deal,
        own_user_id: UserId,
        page_size: u32,
        channel: Arc<HubChannel>,
        api: Arc<BackendClient>,
    ) -> Self {
        Self {
            deal,
            own_user_id,
            page_size,
            channel,
            api,
            state: Mutex::new(ChatState::default()),
        }
    }

    pub fn deal(&self) -> &Deal {
        &self.deal
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    pub async fn has_more(&self) -> bool {
        self.state.lock().await.has_more
    }

    pub async fn load_initial(&self) -> Result<(), ClientError> {
        self.request_history(1).await
    }

    pub async fn load_older(&self) -> Result<(), ClientError> {
        let next_page = self.state.lock().await.last_loaded_page + 1;
        self.request_history(next_page).await
    }

    /// Routes through the hub when connected; falls back to REST
    /// otherwise. Hub results arrive asynchronously via
    /// [`Self::handle_history`].
    pub async fn request_history(&self, page: u32) -> Result<(), ClientError> {
        if self.channel.state() == ChannelState::Connected {
            self.state.lock().await.inflight_page = Some(page);
            self.channel
                .request_history(self.deal.id, page, self.page_size)
                .await?;
            return Ok(());
        }

        debug!(
            deal_id = self.deal.id.0,
            page, "chat: hub unavailable, using REST history fallback"
        );
        let payload = self
            .api
            .get_messages_page(self.deal.id, page, self.page_size)
            .await?;
        self.apply_history(&payload, page).await;
        Ok(())
    }

    /// Hub `MessageHistory` event. Returns the merged page number and the
    /// resulting `has_more` flag.
    pub async fn handle_history(&self, payload: &Value) -> (u32, bool) {
        let page = {
            let mut state = self.state.lock().await;
            state.inflight_page.take().unwrap_or(1)
        };
        self.apply_history(payload, page).await;
        let state = self.state.lock().await;
        (page, state.has_more)
    }

    async fn apply_history(&self, payload: &Value, page: u32) {
        let (items, total) = reconcile::history_items(payload);
        let normalized: Vec<Message> = items
            .iter()
            .map(|item| reconcile::normalize(item, self.deal.id, Some(self.own_user_id)))
            .collect();
        let received = normalized.len();

        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.messages = reconcile::merge_history_page(&state.messages, normalized, page);
        // A full page means older messages may remain above.
        state.has_more = received as u32 >= self.page_size;
        state.last_loaded_page = state.last_loaded_page.max(page);
        info!(
            deal_id = self.deal.id.0,
            page,
            received,
            total = ?total,
            has_more = state.has_more,
            "chat: history page merged"
        );
    }

    /// Hub `GetMessage` event. Returns the absorbed message unless it
    /// belonged to another deal or the session is closed.
    pub async fn handle_live(&self, payload: &Value) -> Option<Message> {
        let message = reconcile::normalize(payload, self.deal.id, Some(self.own_user_id));
        if message.deal_id != self.deal.id {
            return None;
        }
        let mut state = self.state.lock().await;
        if state.closed {
            return None;
        }
        state.messages = reconcile::absorb_live(std::mem::take(&mut state.messages), message.clone());
        Some(message)
    }

    /// The channel preserves no in-flight state across a reconnect; any
    /// unanswered history request is re-issued here.
    pub async fn handle_reconnected(&self) {
        let pending = self.state.lock().await.inflight_page;
        if let Some(page) = pending {
            info!(
                deal_id = self.deal.id.0,
                page, "chat: re-issuing history request after reconnect"
            );
            if let Err(err) = self
                .channel
                .request_history(self.deal.id, page, self.page_size)
                .await
            {
                warn!("chat: history re-issue failed: {err}");
            }
        }
    }

    /// Optimistic send. No optimistic entry is created unless the channel
    /// is connected; the pending entry flips to confirmed on transport
    /// accept and to failed when the write errors.
    pub async fn send(&self, text: &str) -> Result<Message, ClientError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ClientError::Validation(
                "message text must not be empty".into(),
            ));
        }
        if self.channel.state() != ChannelState::Connected {
            return Err(ClientError::NotConnected);
        }

        let now = Utc::now();
        let pending = Message {
            id: MessageId(now.timestamp_millis()),
            deal_id: self.deal.id,
            text: trimmed.to_string(),
            sender_id: self.own_user_id,
            sender_name: None,
            timestamp: now,
            is_own: true,
            is_system: false,
            delivery: Delivery::Pending,
        };
        self.state.lock().await.messages.push(pending.clone());

        match self.channel.send_to(self.deal.id, trimmed, false).await {
            Ok(()) => {
                let confirmed = self.mark_delivery(pending.id, Delivery::Confirmed).await;
                Ok(confirmed.unwrap_or(pending))
            }
            Err(err) => {
                self.mark_delivery(pending.id, Delivery::Failed).await;
                Err(err)
            }
        }
    }

    async fn mark_delivery(&self, id: MessageId, delivery: Delivery) -> Option<Message> {
        let mut state = self.state.lock().await;
        let message = state.messages.iter_mut().find(|m| m.id == id)?;
        message.delivery = delivery;
        Some(message.clone())
    }

    /// Synchronous detach: later events and late REST results are
    /// discarded.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}
