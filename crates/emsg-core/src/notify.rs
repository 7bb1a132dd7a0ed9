use crate::error::EmsgError;
use crate::message::Message;
use crate::time::now_secs;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    MessageReceived,
    MessageSent,
    UserJoined,
    UserLeft,
    Typing,
    DeliveryReceipt,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Notification {
    pub fn new(event: NotificationEvent) -> Self {
        Self {
            event,
            message: None,
            timestamp: now_secs(),
            metadata: Map::new(),
        }
    }
}

pub type NotificationHandler =
    Arc<dyn Fn(&Notification) -> Result<(), EmsgError> + Send + Sync>;
pub type AsyncNotificationHandler =
    Arc<dyn Fn(Notification) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dispatches typed events: synchronous handlers run in registration order
/// and can veto, asynchronous handlers run as independent tasks bounded by a
/// semaphore.
pub struct NotificationManager {
    handlers: RwLock<HashMap<NotificationEvent, Vec<NotificationHandler>>>,
    async_handlers: RwLock<HashMap<NotificationEvent, Vec<AsyncNotificationHandler>>>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl NotificationManager {
    pub fn new(max_concurrent_handlers: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            async_handlers: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent_handlers.max(1))),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn register_handler(&self, event: NotificationEvent, handler: NotificationHandler) {
        self.handlers
            .write()
            .expect("handlers lock")
            .entry(event)
            .or_default()
            .push(handler);
    }

    pub fn register_async_handler(
        &self,
        event: NotificationEvent,
        handler: AsyncNotificationHandler,
    ) {
        self.async_handlers
            .write()
            .expect("handlers lock")
            .entry(event)
            .or_default()
            .push(handler);
    }

    pub fn unregister_handlers(&self, event: NotificationEvent) {
        self.handlers.write().expect("handlers lock").remove(&event);
        self.async_handlers
            .write()
            .expect("handlers lock")
            .remove(&event);
    }

    pub fn handler_count(&self, event: NotificationEvent) -> usize {
        let sync_count = self
            .handlers
            .read()
            .expect("handlers lock")
            .get(&event)
            .map(Vec::len)
            .unwrap_or(0);
        let async_count = self
            .async_handlers
            .read()
            .expect("handlers lock")
            .get(&event)
            .map(Vec::len)
            .unwrap_or(0);
        sync_count + async_count
    }

    /// Runs synchronous handlers in order; the first error short-circuits
    /// and suppresses the asynchronous pass. Async handlers that cannot get
    /// a semaphore slot before shutdown are skipped.
    pub fn notify(&self, notification: &Notification) -> Result<(), EmsgError> {
        let sync_handlers: Vec<NotificationHandler> = self
            .handlers
            .read()
            .expect("handlers lock")
            .get(&notification.event)
            .cloned()
            .unwrap_or_default();
        let async_handlers: Vec<AsyncNotificationHandler> = self
            .async_handlers
            .read()
            .expect("handlers lock")
            .get(&notification.event)
            .cloned()
            .unwrap_or_default();

        for handler in sync_handlers {
            if let Err(err) = handler(notification) {
                log::warn!("notification handler failed: {err}");
                return Err(err);
            }
        }

        for handler in async_handlers {
            let notification = notification.clone();
            let semaphore = self.semaphore.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    permit = semaphore.acquire_owned() => {
                        let Ok(_permit) = permit else { return };
                        if AssertUnwindSafe(handler(notification))
                            .catch_unwind()
                            .await
                            .is_err()
                        {
                            log::warn!("async notification handler panicked");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        log::debug!("shutting down, skipping async handler");
                    }
                }
            });
        }
        Ok(())
    }

    pub fn notify_message_received(&self, message: &Message) -> Result<(), EmsgError> {
        let mut notification = Notification::new(NotificationEvent::MessageReceived);
        if message.is_system() {
            notification
                .metadata
                .insert("is_system".to_string(), Value::Bool(true));
            if let Ok(system) = message.system_message() {
                notification
                    .metadata
                    .insert("system_type".to_string(), Value::String(system.kind));
                notification
                    .metadata
                    .insert("actor".to_string(), Value::String(system.actor));
            }
        }
        if message.is_encrypted() {
            notification
                .metadata
                .insert("is_encrypted".to_string(), Value::Bool(true));
        }
        notification.message = Some(message.clone());
        self.notify(&notification)
    }

    pub fn notify_message_sent(&self, message: &Message) -> Result<(), EmsgError> {
        let mut notification = Notification::new(NotificationEvent::MessageSent);
        notification.metadata.insert(
            "recipients".to_string(),
            Value::Array(
                message
                    .recipients()
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
        );
        notification.message = Some(message.clone());
        self.notify(&notification)
    }

    pub fn notify_user_joined(&self, user: &str, group_id: &str) -> Result<(), EmsgError> {
        let mut notification = Notification::new(NotificationEvent::UserJoined);
        notification
            .metadata
            .insert("user".to_string(), Value::String(user.to_string()));
        notification
            .metadata
            .insert("group_id".to_string(), Value::String(group_id.to_string()));
        self.notify(&notification)
    }

    pub fn notify_user_left(&self, user: &str, group_id: &str) -> Result<(), EmsgError> {
        let mut notification = Notification::new(NotificationEvent::UserLeft);
        notification
            .metadata
            .insert("user".to_string(), Value::String(user.to_string()));
        notification
            .metadata
            .insert("group_id".to_string(), Value::String(group_id.to_string()));
        self.notify(&notification)
    }

    pub fn notify_typing(
        &self,
        user: &str,
        group_id: &str,
        is_typing: bool,
    ) -> Result<(), EmsgError> {
        let mut notification = Notification::new(NotificationEvent::Typing);
        notification
            .metadata
            .insert("user".to_string(), Value::String(user.to_string()));
        notification
            .metadata
            .insert("group_id".to_string(), Value::String(group_id.to_string()));
        notification
            .metadata
            .insert("is_typing".to_string(), Value::Bool(is_typing));
        self.notify(&notification)
    }

    pub fn notify_delivery_receipt(
        &self,
        message_id: &str,
        recipient: &str,
        delivered: bool,
    ) -> Result<(), EmsgError> {
        let mut notification = Notification::new(NotificationEvent::DeliveryReceipt);
        notification
            .metadata
            .insert("message_id".to_string(), Value::String(message_id.to_string()));
        notification
            .metadata
            .insert("recipient".to_string(), Value::String(recipient.to_string()));
        notification
            .metadata
            .insert("delivered".to_string(), Value::Bool(delivered));
        self.notify(&notification)
    }

    /// In-flight async handlers finish naturally; waiting ones are skipped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Narrow capability the poller needs from the client: fetch an inbox.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_messages(&self, address: &str) -> Result<Vec<Message>, EmsgError>;
}

struct PollerState {
    running: bool,
    token: CancellationToken,
}

/// Periodically fetches an inbox and emits `message_received` for messages
/// newer than the previous poll.
pub struct MessagePoller {
    source: Arc<dyn MessageSource>,
    notifications: Arc<NotificationManager>,
    poll_interval: Duration,
    last_poll: Arc<Mutex<i64>>,
    state: Mutex<PollerState>,
}

impl MessagePoller {
    pub fn new(
        source: Arc<dyn MessageSource>,
        notifications: Arc<NotificationManager>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            notifications,
            poll_interval,
            last_poll: Arc::new(Mutex::new(now_secs())),
            state: Mutex::new(PollerState {
                running: false,
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn start(&self, user_address: &str) -> Result<(), EmsgError> {
        let mut state = self.state.lock().expect("poller lock");
        if state.running {
            return Err(EmsgError::State("message poller already running".to_string()));
        }
        state.running = true;
        state.token = CancellationToken::new();

        let token = state.token.clone();
        let source = self.source.clone();
        let notifications = self.notifications.clone();
        let last_poll = self.last_poll.clone();
        let interval = self.poll_interval;
        let address = user_address.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        poll_once(&*source, &notifications, &last_poll, &address).await;
                    }
                    _ = token.cancelled() => return,
                }
            }
        });
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().expect("poller lock");
        if state.running {
            state.token.cancel();
            state.running = false;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("poller lock").running
    }
}

async fn poll_once(
    source: &dyn MessageSource,
    notifications: &NotificationManager,
    last_poll: &Mutex<i64>,
    address: &str,
) {
    // The watermark moves to the instant captured before the fetch, so
    // messages arriving mid-poll surface on the next pass.
    let poll_start = now_secs();
    let messages = match source.fetch_messages(address).await {
        Ok(messages) => messages,
        Err(err) => {
            log::warn!("message poll failed: {err}");
            return;
        }
    };
    let watermark = {
        let mut last = last_poll.lock().expect("watermark lock");
        let previous = *last;
        *last = poll_start;
        previous
    };
    for message in messages {
        if message.timestamp > watermark {
            if let Err(err) = notifications.notify_message_received(&message) {
                log::warn!("failed to notify received message: {err}");
            }
        }
    }
}
