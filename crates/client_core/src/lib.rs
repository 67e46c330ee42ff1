//! Deal-chat client core: ties the session store, the REST client and
//! the realtime hub channel together behind one event-emitting facade.

use std::sync::Arc;

use backend_api::BackendClient;
use storage::Storage;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use zeroize::Zeroize;

use shared::{
    domain::{Deal, DealId, Message, Session},
    error::ClientError,
};

pub mod channel;
pub mod chat;
pub mod config;
pub mod confirm;
pub mod deal;
pub mod reconcile;

pub use channel::{ChannelState, HubChannel, HubEvent, ReconnectPolicy};
pub use chat::ChatSession;
pub use config::{load_settings, Settings};
pub use confirm::{ConfirmState, ConfirmationGate};
pub use deal::{DealController, SettlementAnnouncer};

/// Everything a consumer needs to render the client: reconciled messages,
/// connection lifecycle, deal updates, and errors worth showing.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageReceived(Message),
    HistoryMerged {
        deal_id: DealId,
        page: u32,
        has_more: bool,
    },
    DealUpdated(Deal),
    Reconnecting,
    Reconnected,
    ConnectionClosed,
    HubError(String),
    Error(String),
}

pub struct DealChatClient {
    settings: Settings,
    storage: Storage,
    api: Arc<BackendClient>,
    channel: Arc<HubChannel>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct ClientState {
    session: Option<Session>,
    active_chat: Option<Arc<ChatSession>>,
}

impl DealChatClient {
    pub async fn new(settings: Settings) -> Result<Arc<Self>, ClientError> {
        let storage = Storage::new(&settings.database_url)
            .await
            .map_err(|err| ClientError::Storage(err.to_string()))?;
        Ok(Self::with_parts(settings, storage, HubChannel::new()))
    }

    /// Wiring seam for tests: pre-built storage and channel.
    pub fn with_parts(settings: Settings, storage: Storage, channel: Arc<HubChannel>) -> Arc<Self> {
        let api = Arc::new(BackendClient::new(&settings.base_url, storage.clone()));
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            settings,
            storage,
            api,
            channel,
            inner: Mutex::new(ClientState::default()),
            events,
            pump_task: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn api(&self) -> &Arc<BackendClient> {
        &self.api
    }

    pub fn channel(&self) -> &Arc<HubChannel> {
        &self.channel
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.lock().await.session.clone()
    }

    pub async fn active_chat(&self) -> Option<Arc<ChatSession>> {
        self.inner.lock().await.active_chat.clone()
    }

    pub fn deal_controller(&self) -> DealController {
        DealController::new(
            Arc::clone(&self.api),
            self.storage.clone(),
            Arc::clone(&self.channel) as Arc<dyn SettlementAnnouncer>,
        )
    }

    pub async fn login(
        self: &Arc<Self>,
        email: &str,
        password: &str,
    ) -> Result<Session, ClientError> {
        let session = self.api.login(email, password).await?;
        self.start_session(session.clone()).await?;
        Ok(session)
    }

    /// Resumes a persisted session from a previous run, if any.
    pub async fn restore(self: &Arc<Self>) -> Result<Option<Session>, ClientError> {
        let Some(session) = self
            .storage
            .load_session()
            .await
            .map_err(|err| ClientError::Storage(err.to_string()))?
        else {
            return Ok(None);
        };
        self.start_session(session.clone()).await?;
        Ok(Some(session))
    }

    async fn start_session(self: &Arc<Self>, session: Session) -> Result<(), ClientError> {
        self.channel
            .connect(&self.settings.hub_url(), &session.access_token)
            .await?;
        {
            let mut inner = self.inner.lock().await;
            inner.session = Some(session);
            inner.active_chat = None;
        }
        self.spawn_event_pump().await;

        match self.deal_controller().report_unsettled_transfers().await {
            Ok(pending) if !pending.is_empty() => {
                let _ = self.events.send(ClientEvent::Error(format!(
                    "{} unfinished balance transfer(s) from a previous run need reconciliation",
                    pending.len()
                )));
            }
            Err(err) => warn!("settlement: could not inspect transfer intents: {err}"),
            _ => {}
        }
        Ok(())
    }

    async fn spawn_event_pump(self: &Arc<Self>) {
        let mut events = self.channel.subscribe_events();
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                client.handle_hub_event(event).await;
            }
        });
        if let Some(previous) = self.pump_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    async fn handle_hub_event(&self, event: HubEvent) {
        match event {
            HubEvent::Message(raw) => {
                if let Some(chat) = self.active_chat().await {
                    if let Some(message) = chat.handle_live(&raw).await {
                        let _ = self.events.send(ClientEvent::MessageReceived(message));
                    }
                }
            }
            HubEvent::History(raw) => {
                if let Some(chat) = self.active_chat().await {
                    let (page, has_more) = chat.handle_history(&raw).await;
                    let _ = self.events.send(ClientEvent::HistoryMerged {
                        deal_id: chat.deal().id,
                        page,
                        has_more,
                    });
                }
            }
            HubEvent::HubError(message) => {
                let _ = self.events.send(ClientEvent::HubError(message));
            }
            HubEvent::Reconnecting => {
                let _ = self.events.send(ClientEvent::Reconnecting);
            }
            HubEvent::Reconnected => {
                if let Some(chat) = self.active_chat().await {
                    chat.handle_reconnected().await;
                }
                let _ = self.events.send(ClientEvent::Reconnected);
            }
            HubEvent::Closed => {
                let _ = self.events.send(ClientEvent::ConnectionClosed);
            }
        }
    }

    /// Loads the deal, hydrates its cost from the linked application (the
    /// settlement source of truth) and opens its chat.
    pub async fn open_deal(
        self: &Arc<Self>,
        deal_id: DealId,
    ) -> Result<Arc<ChatSession>, ClientError> {
        let session = self
            .session()
            .await
            .ok_or_else(|| ClientError::Auth("not logged in".into()))?;

        let mut deal = self.api.get_deal(deal_id).await?;
        match self.api.get_application(deal.application_id).await {
            Ok(application) => deal.cost = application.cost,
            Err(err) => warn!(
                deal_id = deal.id.0,
                "deal: could not load linked application, keeping cached cost: {err}"
            ),
        }

        let chat = Arc::new(ChatSession::new(
            deal.clone(),
            session.user_id,
            self.settings.page_size,
            Arc::clone(&self.channel),
            Arc::clone(&self.api),
        ));
        {
            let mut inner = self.inner.lock().await;
            if let Some(previous) = inner.active_chat.replace(Arc::clone(&chat)) {
                previous.close().await;
            }
        }
        let _ = self.events.send(ClientEvent::DealUpdated(deal));

        chat.load_initial().await?;
        Ok(chat)
    }

    /// Detaches the active chat; late events for it are dropped.
    pub async fn close_chat(&self) {
        if let Some(chat) = self.inner.lock().await.active_chat.take() {
            chat.close().await;
        }
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.channel.disconnect().await;
        let session = {
            let mut inner = self.inner.lock().await;
            if let Some(chat) = inner.active_chat.take() {
                chat.close().await;
            }
            inner.session.take()
        };
        self.storage
            .clear_session()
            .await
            .map_err(|err| ClientError::Storage(err.to_string()))?;
        if let Some(mut session) = session {
            session.access_token.zeroize();
            session.refresh_token.zeroize();
        }
        if let Some(task) = self.pump_task.lock().await.take() {
            task.abort();
        }
        info!("auth: logged out");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod reconcile_tests;

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod chat_tests;

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod channel_tests;

#[cfg(test)]
#[path = "tests/deal_tests.rs"]
mod deal_tests;
