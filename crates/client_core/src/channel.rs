//! Persistent connection to the messaging hub: connect, in-band
//! handshake, invocations, and bounded-backoff reconnection.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use shared::{
    domain::DealId,
    error::ClientError,
    protocol::{self, frame_kind, ChatMessageDto, HandshakeResponse, HubFrame},
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Raw hub traffic plus connection lifecycle. Payloads stay untyped here;
/// the reconciler owns their interpretation.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Message(Value),
    History(Value),
    HubError(String),
    Reconnecting,
    Reconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// Transient loss; automatic reconnection applies.
    TransportDropped,
    /// Hub-level close; the channel goes straight to disconnected.
    ServerClosed,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay while less than `threshold` has elapsed since the drop.
    pub initial_delay: Duration,
    pub later_delay: Duration,
    pub threshold: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            later_delay: Duration::from_secs(5),
            threshold: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

pub struct HubChannel {
    inner: Mutex<ChannelInner>,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ChannelState>,
    events: broadcast::Sender<HubEvent>,
}

struct ChannelInner {
    writer: Option<WsSink>,
    hub_url: Option<String>,
    access_token: Option<String>,
    reader_task: Option<JoinHandle<()>>,
    /// Set by `disconnect` so the reader loop exits instead of retrying.
    shutting_down: bool,
}

impl HubChannel {
    pub fn new() -> Arc<Self> {
        Self::with_policy(ReconnectPolicy::default())
    }

    pub fn with_policy(policy: ReconnectPolicy) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            inner: Mutex::new(ChannelInner {
                writer: None,
                hub_url: None,
                access_token: None,
                reader_task: None,
                shutting_down: false,
            }),
            policy,
            state_tx,
            events,
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Opens the hub connection and performs the handshake. Idempotent:
    /// a call while connected or connecting is a no-op.
    pub async fn connect(
        self: &Arc<Self>,
        hub_url: &str,
        access_token: &str,
    ) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            match self.state() {
                ChannelState::Connected | ChannelState::Connecting | ChannelState::Reconnecting => {
                    debug!(state = ?self.state(), "hub: connect skipped, already active");
                    return Ok(());
                }
                ChannelState::Disconnected => {}
            }
            self.state_tx.send_replace(ChannelState::Connecting);
            guard.shutting_down = false;
            guard.hub_url = Some(hub_url.to_string());
            guard.access_token = Some(access_token.to_string());
        }

        match open_socket(hub_url, access_token).await {
            Ok((writer, reader)) => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.writer = Some(writer);
                    let task = self.spawn_reader(reader);
                    if let Some(previous) = guard.reader_task.replace(task) {
                        previous.abort();
                    }
                }
                self.state_tx.send_replace(ChannelState::Connected);
                info!(hub_url, "hub: connected");
                Ok(())
            }
            Err(err) => {
                self.state_tx.send_replace(ChannelState::Disconnected);
                Err(err)
            }
        }
    }

    /// Explicit close; the channel does not restart afterwards.
    pub async fn disconnect(&self) {
        let writer = {
            let mut guard = self.inner.lock().await;
            guard.shutting_down = true;
            guard.writer.take()
        };
        if let Some(mut writer) = writer {
            let _ = writer.send(WsMessage::Close(None)).await;
            let _ = writer.close().await;
        }
        self.state_tx.send_replace(ChannelState::Disconnected);
        info!("hub: disconnected");
    }

    pub async fn send_to(
        &self,
        deal_id: DealId,
        text: &str,
        is_system: bool,
    ) -> Result<(), ClientError> {
        let dto = ChatMessageDto {
            deal_id,
            text: text.to_string(),
            is_system: is_system.then_some(true),
        };
        let argument = serde_json::to_value(&dto)
            .map_err(|err| ClientError::Validation(format!("unencodable message: {err}")))?;
        self.invoke(protocol::SEND_TO, vec![argument]).await
    }

    /// Fire-and-wait: the page arrives later as [`HubEvent::History`],
    /// never as a return value.
    pub async fn request_history(
        &self,
        deal_id: DealId,
        page: u32,
        page_size: u32,
    ) -> Result<(), ClientError> {
        self.invoke(
            protocol::GET_MESSAGE_HISTORY,
            vec![json!(deal_id.0), json!(page), json!(page_size)],
        )
        .await
    }

    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<(), ClientError> {
        if self.state() != ChannelState::Connected {
            return Err(ClientError::NotConnected);
        }
        let frame = HubFrame::invocation(target, arguments);
        let encoded = protocol::encode_frame(&frame)
            .map_err(|err| ClientError::Validation(format!("unencodable frame: {err}")))?;

        let mut guard = self.inner.lock().await;
        let writer = guard.writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(WsMessage::Text(encoded))
            .await
            .map_err(|err| ClientError::Connection(format!("websocket send failed: {err}")))
    }

    fn spawn_reader(self: &Arc<Self>, reader: WsSource) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let outcome = channel.read_until_drop(&mut reader).await;
                if outcome == ReadOutcome::ServerClosed
                    || channel.inner.lock().await.shutting_down
                {
                    break;
                }
                match channel.reconnect().await {
                    Ok(new_reader) => reader = new_reader,
                    Err(err) => {
                        warn!("hub: giving up on reconnection: {err}");
                        break;
                    }
                }
            }
            channel.state_tx.send_replace(ChannelState::Disconnected);
            let _ = channel.events.send(HubEvent::Closed);
        })
    }

    /// Reads until the transport drops or the hub asks to close.
    async fn read_until_drop(&self, reader: &mut WsSource) -> ReadOutcome {
        while let Some(message) = reader.next().await {
            match message {
                Ok(WsMessage::Text(payload)) => {
                    if let Some(outcome) = self.dispatch_text(&payload) {
                        return outcome;
                    }
                }
                Ok(WsMessage::Close(_)) => return ReadOutcome::TransportDropped,
                Ok(_) => {}
                Err(err) => {
                    warn!("hub: websocket receive failed: {err}");
                    return ReadOutcome::TransportDropped;
                }
            }
        }
        ReadOutcome::TransportDropped
    }

    /// `Some` when the connection is over; reading continues on `None`.
    fn dispatch_text(&self, payload: &str) -> Option<ReadOutcome> {
        for segment in protocol::split_frames(payload) {
            let frame: HubFrame = match serde_json::from_str(segment) {
                Ok(frame) => frame,
                Err(err) => {
                    let _ = self
                        .events
                        .send(HubEvent::HubError(format!("invalid hub frame: {err}")));
                    continue;
                }
            };
            match frame.kind {
                frame_kind::INVOCATION => self.dispatch_invocation(frame),
                frame_kind::PING => {}
                frame_kind::CLOSE => {
                    warn!(error = ?frame.error, "hub: server closed the connection");
                    // A close frame is terminal unless the hub explicitly
                    // allows reconnecting.
                    return Some(if frame.allow_reconnect == Some(true) {
                        ReadOutcome::TransportDropped
                    } else {
                        ReadOutcome::ServerClosed
                    });
                }
                other => debug!(kind = other, "hub: ignoring frame"),
            }
        }
        None
    }

    fn dispatch_invocation(&self, frame: HubFrame) {
        let target = frame.target.unwrap_or_default();
        let mut arguments = frame.arguments.unwrap_or_default();
        let first = if arguments.is_empty() {
            Value::Null
        } else {
            arguments.remove(0)
        };

        let event = match target.as_str() {
            protocol::GET_MESSAGE => HubEvent::Message(first),
            protocol::MESSAGE_HISTORY => HubEvent::History(first),
            protocol::HUB_ERROR => HubEvent::HubError(
                first
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| first.to_string()),
            ),
            other => {
                debug!(invocation = other, "hub: ignoring unknown invocation target");
                return;
            }
        };
        let _ = self.events.send(event);
    }

    async fn reconnect(self: &Arc<Self>) -> Result<WsSource, ClientError> {
        self.state_tx.send_replace(ChannelState::Reconnecting);
        let _ = self.events.send(HubEvent::Reconnecting);

        let (hub_url, access_token) = {
            let guard = self.inner.lock().await;
            match (guard.hub_url.clone(), guard.access_token.clone()) {
                (Some(url), Some(token)) => (url, token),
                _ => {
                    return Err(ClientError::Connection(
                        "no connection parameters to reconnect with".into(),
                    ))
                }
            }
        };

        let dropped_at = Instant::now();
        for attempt in 1..=self.policy.max_attempts {
            let delay = if dropped_at.elapsed() < self.policy.threshold {
                self.policy.initial_delay
            } else {
                self.policy.later_delay
            };
            tokio::time::sleep(delay).await;

            if self.inner.lock().await.shutting_down {
                return Err(ClientError::Connection(
                    "channel shut down during reconnect".into(),
                ));
            }

            match open_socket(&hub_url, &access_token).await {
                Ok((writer, reader)) => {
                    self.inner.lock().await.writer = Some(writer);
                    self.state_tx.send_replace(ChannelState::Connected);
                    let _ = self.events.send(HubEvent::Reconnected);
                    info!(attempt, "hub: reconnected");
                    return Ok(reader);
                }
                Err(err) => warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    "hub: reconnect attempt failed: {err}"
                ),
            }
        }

        Err(ClientError::Connection(format!(
            "reconnect attempts exhausted after {} tries",
            self.policy.max_attempts
        )))
    }
}

/// Connect the WebSocket and run the in-band handshake. The hub expects
/// the token in the query string when negotiation is skipped.
async fn open_socket(hub_url: &str, access_token: &str) -> Result<(WsSink, WsSource), ClientError> {
    let ws_url = hub_ws_url(hub_url, access_token)?;
    let (stream, _) = connect_async(&ws_url)
        .await
        .map_err(|err| ClientError::Connection(format!("websocket connect failed: {err}")))?;
    let (mut writer, mut reader) = stream.split();

    let handshake = protocol::encode_handshake()
        .map_err(|err| ClientError::Connection(format!("handshake encode failed: {err}")))?;
    writer
        .send(WsMessage::Text(handshake))
        .await
        .map_err(|err| ClientError::Connection(format!("handshake send failed: {err}")))?;

    loop {
        match reader.next().await {
            Some(Ok(WsMessage::Text(payload))) => {
                let Some(first) = protocol::split_frames(&payload).next() else {
                    continue;
                };
                let response: HandshakeResponse = serde_json::from_str(first).map_err(|err| {
                    ClientError::Connection(format!("malformed handshake response: {err}"))
                })?;
                if let Some(error) = response.error {
                    return Err(ClientError::Connection(format!(
                        "hub handshake rejected: {error}"
                    )));
                }
                return Ok((writer, reader));
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ClientError::Connection(
                    "connection closed before handshake completed".into(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                return Err(ClientError::Connection(format!(
                    "handshake receive failed: {err}"
                )));
            }
        }
    }
}

fn hub_ws_url(hub_url: &str, access_token: &str) -> Result<String, ClientError> {
    let ws_base = if let Some(rest) = hub_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = hub_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if hub_url.starts_with("ws://") || hub_url.starts_with("wss://") {
        hub_url.to_string()
    } else {
        return Err(ClientError::Validation(format!(
            "hub url must be http(s) or ws(s): {hub_url}"
        )));
    };

    let mut url = url::Url::parse(&ws_base)
        .map_err(|err| ClientError::Validation(format!("invalid hub url: {err}")))?;
    url.query_pairs_mut()
        .append_pair("access_token", access_token);
    Ok(url.into())
}
