use crate::auth::AuthHeader;
use crate::config::StreamConfig;
use crate::error::EmsgError;
use crate::keys::KeyPair;
use crate::message::Message;
use crate::notify::NotificationManager;
use crate::time::now_secs;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

pub const STREAM_PATH: &str = "/api/v1/ws";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Wire frame exchanged over the stream endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamEvent {
    Connected,
    Disconnected,
    Message,
    Error,
    Reconnecting,
}

pub type StreamEventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct ConnState {
    connected: bool,
    connecting: bool,
    user_address: String,
    token: CancellationToken,
    send_tx: Option<mpsc::Sender<WsMessage>>,
}

/// One persistent bidirectional connection per user. Four cooperating tasks
/// (read, write, ping, processor) share a cancellation token; failure of the
/// read side tears the rest down and drives reconnection.
#[derive(Clone)]
pub struct StreamClient {
    server_url: String,
    key_pair: Arc<KeyPair>,
    notifications: Option<Arc<NotificationManager>>,
    config: StreamConfig,
    state: Arc<Mutex<ConnState>>,
    event_handlers: Arc<RwLock<HashMap<StreamEvent, Vec<StreamEventHandler>>>>,
}

impl StreamClient {
    pub fn new(
        server_url: &str,
        key_pair: Arc<KeyPair>,
        notifications: Option<Arc<NotificationManager>>,
        config: StreamConfig,
    ) -> Self {
        Self {
            server_url: server_url.to_string(),
            key_pair,
            notifications,
            config,
            state: Arc::new(Mutex::new(ConnState {
                connected: false,
                connecting: false,
                user_address: String::new(),
                token: CancellationToken::new(),
                send_tx: None,
            })),
            event_handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn connect(&self, user_address: &str) -> Result<(), EmsgError> {
        {
            let mut state = self.state.lock().expect("stream state lock");
            if state.connected || state.connecting {
                return Err(EmsgError::State(
                    "already connected or connecting".to_string(),
                ));
            }
            state.connecting = true;
        }
        let result = self.establish(user_address).await;
        self.state.lock().expect("stream state lock").connecting = false;
        result
    }

    async fn establish(&self, user_address: &str) -> Result<(), EmsgError> {
        let url = stream_url(&self.server_url, user_address)?;
        let auth = AuthHeader::generate(&self.key_pair, "GET", STREAM_PATH);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| EmsgError::Transport(format!("stream request: {e}")))?;
        let header = HeaderValue::from_str(&auth.header_value())
            .map_err(|e| EmsgError::Transport(format!("auth header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_frame_size),
            max_frame_size: Some(self.config.max_frame_size),
            ..WebSocketConfig::default()
        };
        let (ws, _response) = tokio::time::timeout(
            self.config.handshake_timeout,
            connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .map_err(|_| EmsgError::Timeout)?
        .map_err(|e| EmsgError::Transport(format!("stream handshake: {e}")))?;

        let (sink, source) = ws.split();
        let (send_tx, send_rx) = mpsc::channel(self.config.queue_capacity);
        let (recv_tx, recv_rx) = mpsc::channel(self.config.queue_capacity);
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock().expect("stream state lock");
            state.connected = true;
            state.user_address = user_address.to_string();
            state.token = token.clone();
            state.send_tx = Some(send_tx.clone());
        }

        self.spawn_read_loop(source, recv_tx, token.clone());
        self.spawn_write_loop(sink, send_rx, token.clone());
        self.spawn_ping_loop(send_tx, token.clone());
        self.spawn_processor(recv_rx, token);

        self.trigger_event(StreamEvent::Connected, Value::Null);
        Ok(())
    }

    /// Serializes the message and offers it to the bounded send queue
    /// without blocking. Frames are transmitted in enqueue order.
    pub fn send(&self, message: &Message) -> Result<(), EmsgError> {
        let frame = StreamFrame {
            kind: "message".to_string(),
            message: Some(message.clone()),
            event: String::new(),
            data: None,
            timestamp: now_secs(),
        };
        let text = serde_json::to_string(&frame)?;
        let state = self.state.lock().expect("stream state lock");
        if !state.connected {
            return Err(EmsgError::State("not connected".to_string()));
        }
        let send_tx = state
            .send_tx
            .as_ref()
            .ok_or_else(|| EmsgError::State("not connected".to_string()))?;
        match send_tx.try_send(WsMessage::Text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EmsgError::BufferFull),
            Err(TrySendError::Closed(_)) => {
                Err(EmsgError::Transport("stream closed".to_string()))
            }
        }
    }

    /// Cancels the shared token; the write loop sends a close frame on its
    /// way out.
    pub fn disconnect(&self) -> Result<(), EmsgError> {
        {
            let mut state = self.state.lock().expect("stream state lock");
            if !state.connected {
                return Err(EmsgError::State("not connected".to_string()));
            }
            state.connected = false;
            state.send_tx = None;
            state.token.cancel();
        }
        self.trigger_event(StreamEvent::Disconnected, Value::Null);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().expect("stream state lock").connected
    }

    pub fn register_event_handler(&self, event: StreamEvent, handler: StreamEventHandler) {
        self.event_handlers
            .write()
            .expect("event handlers lock")
            .entry(event)
            .or_default()
            .push(handler);
    }

    fn spawn_read_loop(
        &self,
        mut source: WsSource,
        recv_tx: mpsc::Sender<StreamFrame>,
        token: CancellationToken,
    ) {
        let client = self.clone();
        let read_timeout = self.config.read_timeout;
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => return,
                    next = tokio::time::timeout(read_timeout, source.next()) => next,
                };
                let frame = match next {
                    Err(_) => {
                        log::warn!("stream read deadline exceeded");
                        break;
                    }
                    Ok(None) => {
                        log::info!("stream closed by server");
                        break;
                    }
                    Ok(Some(Err(err))) => {
                        log::warn!("stream read error: {err}");
                        client.trigger_event(
                            StreamEvent::Error,
                            Value::String(err.to_string()),
                        );
                        break;
                    }
                    Ok(Some(Ok(frame))) => frame,
                };
                match frame {
                    WsMessage::Text(text) => {
                        client.enqueue_frame(&recv_tx, text.as_bytes()).await;
                    }
                    WsMessage::Binary(data) => {
                        client.enqueue_frame(&recv_tx, &data).await;
                    }
                    // Any inbound frame, pongs included, extends the read
                    // deadline on the next loop turn.
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                    WsMessage::Close(_) => {
                        log::info!("received close frame");
                        break;
                    }
                }
            }
            client.handle_read_failure().await;
        });
    }

    async fn enqueue_frame(&self, recv_tx: &mpsc::Sender<StreamFrame>, raw: &[u8]) {
        match serde_json::from_slice::<StreamFrame>(raw) {
            Ok(frame) => {
                // Preserves receive order; applies backpressure when full.
                let _ = recv_tx.send(frame).await;
            }
            Err(err) => log::warn!("dropping unparseable stream frame: {err}"),
        }
    }

    fn spawn_write_loop(
        &self,
        mut sink: WsSink,
        mut send_rx: mpsc::Receiver<WsMessage>,
        token: CancellationToken,
    ) {
        let write_timeout = self.config.write_timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return;
                    }
                    frame = send_rx.recv() => {
                        let Some(frame) = frame else { return };
                        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                log::warn!("stream write error: {err}");
                                return;
                            }
                            Err(_) => {
                                log::warn!("stream write deadline exceeded");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_ping_loop(&self, send_tx: mpsc::Sender<WsMessage>, token: CancellationToken) {
        let ping_interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if send_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_processor(&self, mut recv_rx: mpsc::Receiver<StreamFrame>, token: CancellationToken) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    frame = recv_rx.recv() => {
                        let Some(frame) = frame else { return };
                        client.dispatch(frame);
                    }
                }
            }
        });
    }

    fn dispatch(&self, frame: StreamFrame) {
        match frame.kind.as_str() {
            "message" => {
                let Some(message) = frame.message else {
                    log::warn!("message frame without message payload");
                    return;
                };
                if let Some(notifications) = &self.notifications {
                    if let Err(err) = notifications.notify_message_received(&message) {
                        log::warn!("failed to notify received message: {err}");
                    }
                }
                let payload = serde_json::to_value(&message).unwrap_or(Value::Null);
                self.trigger_event(StreamEvent::Message, payload);
            }
            "event" => self.dispatch_event(frame),
            other => log::warn!("unknown stream frame type: {other}"),
        }
    }

    fn dispatch_event(&self, frame: StreamFrame) {
        let Some(notifications) = &self.notifications else {
            return;
        };
        let data = frame.data.unwrap_or(Value::Null);
        let result = match frame.event.as_str() {
            "user_joined" => match (str_field(&data, "user"), str_field(&data, "group_id")) {
                (Some(user), Some(group_id)) => notifications.notify_user_joined(user, group_id),
                _ => return,
            },
            "user_left" => match (str_field(&data, "user"), str_field(&data, "group_id")) {
                (Some(user), Some(group_id)) => notifications.notify_user_left(user, group_id),
                _ => return,
            },
            "typing" => match (
                str_field(&data, "user"),
                str_field(&data, "group_id"),
                bool_field(&data, "is_typing"),
            ) {
                (Some(user), Some(group_id), Some(is_typing)) => {
                    notifications.notify_typing(user, group_id, is_typing)
                }
                _ => return,
            },
            "delivery_receipt" => match (
                str_field(&data, "message_id"),
                str_field(&data, "recipient"),
                bool_field(&data, "delivered"),
            ) {
                (Some(message_id), Some(recipient), Some(delivered)) => {
                    notifications.notify_delivery_receipt(message_id, recipient, delivered)
                }
                _ => return,
            },
            other => {
                log::warn!("unknown stream event: {other}");
                return;
            }
        };
        if let Err(err) = result {
            log::warn!("stream event notification failed: {err}");
        }
    }

    async fn handle_read_failure(&self) {
        let (was_connected, cancelled, user_address) = {
            let mut state = self.state.lock().expect("stream state lock");
            let cancelled = state.token.is_cancelled();
            let was_connected = state.connected;
            state.connected = false;
            state.send_tx = None;
            if !cancelled {
                state.token.cancel();
            }
            (was_connected, cancelled, state.user_address.clone())
        };
        if cancelled || !was_connected {
            return;
        }
        self.trigger_event(StreamEvent::Disconnected, Value::Null);
        if self.config.reconnect.enabled {
            self.reconnect(&user_address).await;
        }
    }

    /// Retries until success or `max_retries`, with capped exponential
    /// backoff between attempts.
    async fn reconnect(&self, user_address: &str) {
        let strategy = &self.config.reconnect;
        for attempt in 0..strategy.max_retries {
            let delay = strategy.delay_for_attempt(attempt);
            log::info!(
                "reconnecting in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                strategy.max_retries
            );
            self.trigger_event(
                StreamEvent::Reconnecting,
                json!({
                    "attempt": attempt + 1,
                    "max_attempts": strategy.max_retries,
                }),
            );
            tokio::time::sleep(delay).await;
            match self.connect(user_address).await {
                Ok(()) => return,
                // Another caller re-established the connection meanwhile.
                Err(EmsgError::State(_)) => return,
                Err(err) => log::warn!("reconnect attempt {} failed: {err}", attempt + 1),
            }
        }
        log::warn!("reconnect attempts exhausted");
    }

    fn trigger_event(&self, event: StreamEvent, data: Value) {
        let handlers: Vec<StreamEventHandler> = self
            .event_handlers
            .read()
            .expect("event handlers lock")
            .get(&event)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            let data = data.clone();
            tokio::spawn(async move {
                if catch_unwind(AssertUnwindSafe(|| handler(&data))).is_err() {
                    log::warn!("stream event handler panicked");
                }
            });
        }
    }
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn bool_field(data: &Value, key: &str) -> Option<bool> {
    data.get(key).and_then(Value::as_bool)
}

/// Derives the stream endpoint from a server URL: `http` becomes `ws`,
/// `https` becomes `wss`, the path is fixed, and the query carries the
/// URL-encoded user address.
pub fn stream_url(server_url: &str, user_address: &str) -> Result<Url, EmsgError> {
    let mut url = Url::parse(server_url)
        .map_err(|e| EmsgError::Validation(format!("server url: {e}")))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(EmsgError::Validation(format!(
                "unsupported server url scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| EmsgError::Validation("server url scheme".to_string()))?;
    url.set_path(STREAM_PATH);
    url.query_pairs_mut()
        .clear()
        .append_pair("address", user_address);
    Ok(url)
}
