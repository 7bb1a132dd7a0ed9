pub mod attachments;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod dns;
pub mod error;
pub mod gateway;
pub mod groups;
pub mod keys;
pub mod message;
pub mod notify;
pub mod stream;
pub mod time;

use attachments::{Attachment, AttachmentManager};
use config::ClientConfig;
use crypto::{EncryptionKeyPair, EncryptionManager, KeyStore};
use delivery::{DeliveryCallback, DeliveryReceipt, DeliveryStatus, DeliveryTracker};
use dns::{ServerInfo, SystemTxtLookup, TxtLookup};
use emsg_api::{extract_domain, Address};
use error::EmsgError;
use gateway::{HttpGateway, ServerResponse};
use groups::GroupManager;
use keys::KeyPair;
use message::{Message, MessageBuilder, SystemMessageBuilder};
use notify::{
    AsyncNotificationHandler, MessagePoller, NotificationEvent, NotificationHandler,
    NotificationManager,
};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use stream::{StreamClient, StreamEvent, StreamEventHandler};

pub type BeforeSendHook = Arc<dyn Fn(&Message) -> Result<(), EmsgError> + Send + Sync>;
pub type AfterSendHook =
    Arc<dyn Fn(&Message, &ServerResponse) -> Result<(), EmsgError> + Send + Sync>;

/// The EMSG client: composes, signs, and fans out messages to servers
/// discovered over DNS, and feeds inbound events to the notification bus.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    key_pair: Arc<KeyPair>,
    gateway: Arc<HttpGateway>,
    encryption: Arc<RwLock<Option<Arc<EncryptionManager>>>>,
    notifications: Option<Arc<NotificationManager>>,
    poller: Option<Arc<MessagePoller>>,
    delivery: Option<Arc<DeliveryTracker>>,
    attachments: Arc<AttachmentManager>,
    groups: Arc<GroupManager>,
    stream: Arc<Mutex<Option<StreamClient>>>,
    before_send: Option<BeforeSendHook>,
    after_send: Option<AfterSendHook>,
}

impl Client {
    /// Builds a client resolving over the system DNS configuration.
    pub fn new(config: ClientConfig, key_pair: KeyPair) -> Result<Self, EmsgError> {
        let lookup: Arc<dyn TxtLookup> = Arc::new(SystemTxtLookup::new()?);
        Self::with_lookup(config, key_pair, lookup)
    }

    /// Builds a client with an injected TXT record source, so tests and
    /// embedded setups control discovery.
    pub fn with_lookup(
        config: ClientConfig,
        key_pair: KeyPair,
        lookup: Arc<dyn TxtLookup>,
    ) -> Result<Self, EmsgError> {
        let key_pair = Arc::new(key_pair);
        let gateway = Arc::new(HttpGateway::new(&config, key_pair.clone(), lookup)?);

        let notifications = config
            .enable_notifications
            .then(|| Arc::new(NotificationManager::new(config.max_concurrent_handlers)));
        let poller = notifications.as_ref().map(|notifications| {
            let source: Arc<dyn notify::MessageSource> = gateway.clone();
            Arc::new(MessagePoller::new(
                source,
                notifications.clone(),
                config.poll_interval,
            ))
        });
        let delivery = config
            .enable_delivery_tracking
            .then(|| Arc::new(DeliveryTracker::new(config.delivery.clone())));
        let attachments = Arc::new(AttachmentManager::new(config.attachments.clone())?);

        Ok(Self {
            config,
            key_pair,
            gateway,
            encryption: Arc::new(RwLock::new(None)),
            notifications,
            poller,
            delivery,
            attachments,
            groups: Arc::new(GroupManager::new()),
            stream: Arc::new(Mutex::new(None)),
            before_send: None,
            after_send: None,
        })
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn set_before_send(&mut self, hook: BeforeSendHook) {
        self.before_send = Some(hook);
    }

    pub fn set_after_send(&mut self, hook: AfterSendHook) {
        self.after_send = Some(hook);
    }

    /// Message builder pre-wired with this client's encryption and
    /// attachment managers.
    pub fn compose_message(&self) -> MessageBuilder {
        let mut builder = MessageBuilder::new().with_attachment_manager(self.attachments.clone());
        if let Some(encryption) = self.encryption.read().expect("encryption lock").as_ref() {
            builder = builder.with_encryption(encryption.clone());
        }
        builder
    }

    pub fn compose_system_message(&self) -> SystemMessageBuilder {
        SystemMessageBuilder::new()
    }

    /// Sends a built message: hook, validate, sign, then fan out by
    /// recipient domain with per-request retry. The delivery receipt tracks
    /// the outcome.
    pub async fn send(&self, mut message: Message) -> Result<(), EmsgError> {
        if let Some(tracker) = &self.delivery {
            tracker.track(&message);
        }

        if let Some(hook) = &self.before_send {
            if let Err(err) = hook(&message) {
                self.mark_failed(&message.message_id, &err);
                return Err(EmsgError::State(format!("before send hook: {err}")));
            }
        }

        if let Err(err) = message.validate() {
            self.mark_failed(&message.message_id, &err);
            return Err(err);
        }
        if let Err(err) = message.sign(&self.key_pair) {
            self.mark_failed(&message.message_id, &err);
            return Err(err);
        }

        let mut last_response = None;
        for domain in recipient_domains(&message) {
            match self.gateway.post_message(&domain, &message).await {
                Ok(response) => last_response = Some(response),
                Err(err) => {
                    let err = EmsgError::Transport(format!(
                        "send to domain {domain} failed: {err}"
                    ));
                    self.mark_failed(&message.message_id, &err);
                    return Err(err);
                }
            }
        }

        if let Some(tracker) = &self.delivery {
            if let Err(err) =
                tracker.update_status(&message.message_id, DeliveryStatus::Sent, None)
            {
                log::warn!("failed to update delivery status: {err}");
            }
        }

        if let (Some(hook), Some(response)) = (&self.after_send, last_response.as_ref()) {
            if let Err(err) = hook(&message, response) {
                log::warn!("after send hook failed: {err}");
            }
        }

        if let Some(notifications) = &self.notifications {
            if let Err(err) = notifications.notify_message_sent(&message) {
                log::warn!("failed to notify message sent: {err}");
            }
        }
        Ok(())
    }

    fn mark_failed(&self, message_id: &str, err: &EmsgError) {
        if let Some(tracker) = &self.delivery {
            if let Err(update_err) =
                tracker.update_status(message_id, DeliveryStatus::Failed, Some(&err.to_string()))
            {
                log::debug!("failed receipt update skipped: {update_err}");
            }
        }
    }

    pub async fn register_user(&self, address: &str) -> Result<(), EmsgError> {
        let address = Address::parse(address)?;
        self.gateway.register_user(&address).await?;
        Ok(())
    }

    pub async fn get_messages(&self, address: &str) -> Result<Vec<Message>, EmsgError> {
        let address = Address::parse(address)?;
        self.gateway.get_messages(&address).await
    }

    pub async fn resolve_domain(&self, domain: &str) -> Result<ServerInfo, EmsgError> {
        self.gateway.resolve_domain(domain).await
    }

    // Encryption

    pub fn enable_encryption(&self, key_pair: EncryptionKeyPair, store: Arc<dyn KeyStore>) {
        *self.encryption.write().expect("encryption lock") =
            Some(Arc::new(EncryptionManager::new(key_pair, store)));
    }

    pub fn disable_encryption(&self) {
        *self.encryption.write().expect("encryption lock") = None;
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.encryption.read().expect("encryption lock").is_some()
    }

    pub fn register_public_key(&self, address: &str, public_b64: &str) -> Result<(), EmsgError> {
        self.encryption_manager()?.register_public_key(address, public_b64)
    }

    pub fn can_encrypt_for(&self, address: &str) -> bool {
        self.encryption
            .read()
            .expect("encryption lock")
            .as_ref()
            .map(|manager| manager.can_encrypt_for(address))
            .unwrap_or(false)
    }

    /// Opens the envelope held in an encrypted message body.
    pub fn decrypt_message(&self, message: &Message) -> Result<String, EmsgError> {
        let envelope = message.envelope()?;
        let plaintext = self.encryption_manager()?.decrypt_message(&envelope)?;
        String::from_utf8(plaintext)
            .map_err(|_| EmsgError::Crypto("plaintext is not UTF-8".to_string()))
    }

    fn encryption_manager(&self) -> Result<Arc<EncryptionManager>, EmsgError> {
        self.encryption
            .read()
            .expect("encryption lock")
            .clone()
            .ok_or_else(|| EmsgError::State("encryption not enabled".to_string()))
    }

    // Notifications

    pub fn register_notification_handler(
        &self,
        event: NotificationEvent,
        handler: NotificationHandler,
    ) -> Result<(), EmsgError> {
        self.notification_manager()?.register_handler(event, handler);
        Ok(())
    }

    pub fn register_async_notification_handler(
        &self,
        event: NotificationEvent,
        handler: AsyncNotificationHandler,
    ) -> Result<(), EmsgError> {
        self.notification_manager()?
            .register_async_handler(event, handler);
        Ok(())
    }

    pub fn unregister_notification_handlers(
        &self,
        event: NotificationEvent,
    ) -> Result<(), EmsgError> {
        self.notification_manager()?.unregister_handlers(event);
        Ok(())
    }

    pub fn notification_handler_count(&self, event: NotificationEvent) -> usize {
        self.notifications
            .as_ref()
            .map(|manager| manager.handler_count(event))
            .unwrap_or(0)
    }

    pub fn is_notifications_enabled(&self) -> bool {
        self.notifications.is_some()
    }

    pub fn start_message_polling(&self, user_address: &str) -> Result<(), EmsgError> {
        self.poller
            .as_ref()
            .ok_or_else(|| EmsgError::State("notifications not enabled".to_string()))?
            .start(user_address)
    }

    pub fn stop_message_polling(&self) {
        if let Some(poller) = &self.poller {
            poller.stop();
        }
    }

    pub fn is_message_polling_running(&self) -> bool {
        self.poller
            .as_ref()
            .map(|poller| poller.is_running())
            .unwrap_or(false)
    }

    pub fn shutdown_notifications(&self) {
        if let Some(notifications) = &self.notifications {
            notifications.shutdown();
        }
    }

    fn notification_manager(&self) -> Result<&Arc<NotificationManager>, EmsgError> {
        self.notifications
            .as_ref()
            .ok_or_else(|| EmsgError::State("notifications not enabled".to_string()))
    }

    // Real-time stream

    /// Resolves the user's home server and opens the persistent stream.
    pub async fn connect_stream(&self, user_address: &str) -> Result<(), EmsgError> {
        if self.is_stream_connected() {
            return Err(EmsgError::State("stream already connected".to_string()));
        }
        let domain = extract_domain(user_address)?;
        let server = self.gateway.resolve_domain(&domain).await?;
        let client = StreamClient::new(
            &server.url,
            self.key_pair.clone(),
            self.notifications.clone(),
            self.config.stream.clone(),
        );
        *self.stream.lock().expect("stream lock") = Some(client.clone());
        client.connect(user_address).await
    }

    pub fn disconnect_stream(&self) -> Result<(), EmsgError> {
        self.stream_client()?.disconnect()
    }

    pub fn is_stream_connected(&self) -> bool {
        self.stream
            .lock()
            .expect("stream lock")
            .as_ref()
            .map(|client| client.is_connected())
            .unwrap_or(false)
    }

    /// Sends over the stream when connected, otherwise falls back to HTTP.
    pub async fn send_via_stream(&self, message: Message) -> Result<(), EmsgError> {
        let connected = self
            .stream
            .lock()
            .expect("stream lock")
            .as_ref()
            .filter(|client| client.is_connected())
            .cloned();
        match connected {
            Some(client) => client.send(&message),
            None => self.send(message).await,
        }
    }

    pub fn register_stream_event_handler(
        &self,
        event: StreamEvent,
        handler: StreamEventHandler,
    ) -> Result<(), EmsgError> {
        self.stream_client()?.register_event_handler(event, handler);
        Ok(())
    }

    fn stream_client(&self) -> Result<StreamClient, EmsgError> {
        self.stream
            .lock()
            .expect("stream lock")
            .clone()
            .ok_or_else(|| EmsgError::State("stream not initialized".to_string()))
    }

    // Delivery tracking

    pub fn delivery_receipt(&self, message_id: &str) -> Result<DeliveryReceipt, EmsgError> {
        self.delivery_tracker()?.get_receipt(message_id)
    }

    pub fn delivery_stats(&self) -> HashMap<DeliveryStatus, usize> {
        self.delivery
            .as_ref()
            .map(|tracker| tracker.get_stats())
            .unwrap_or_default()
    }

    pub fn register_delivery_callback(
        &self,
        message_id: &str,
        callback: DeliveryCallback,
    ) -> Result<(), EmsgError> {
        self.delivery_tracker()?.register_callback(message_id, callback);
        Ok(())
    }

    pub fn register_global_delivery_callback(
        &self,
        callback: DeliveryCallback,
    ) -> Result<(), EmsgError> {
        self.delivery_tracker()?.register_global_callback(callback);
        Ok(())
    }

    pub fn pending_retries(&self) -> Vec<DeliveryReceipt> {
        self.delivery
            .as_ref()
            .map(|tracker| tracker.get_pending_retries())
            .unwrap_or_default()
    }

    pub fn cleanup_expired_receipts(&self) -> usize {
        self.delivery
            .as_ref()
            .map(|tracker| tracker.cleanup_expired())
            .unwrap_or(0)
    }

    pub fn is_delivery_tracking_enabled(&self) -> bool {
        self.delivery.is_some()
    }

    fn delivery_tracker(&self) -> Result<&Arc<DeliveryTracker>, EmsgError> {
        self.delivery
            .as_ref()
            .ok_or_else(|| EmsgError::State("delivery tracking not enabled".to_string()))
    }

    // Attachments

    pub fn create_attachment_from_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Attachment, EmsgError> {
        self.attachments.create_from_file(path)
    }

    pub fn create_attachment_from_data(
        &self,
        name: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<Attachment, EmsgError> {
        self.attachments.create_from_data(name, data, mime_type)
    }

    pub fn save_attachment(&self, attachment: &Attachment) -> Result<(), EmsgError> {
        self.attachments.save(attachment)
    }

    pub fn load_attachment(&self, attachment_id: &str) -> Result<Attachment, EmsgError> {
        self.attachments.load(attachment_id)
    }

    pub fn validate_attachment(&self, attachment: &Attachment) -> Result<(), EmsgError> {
        self.attachments.validate(attachment)
    }

    pub fn attachment_data(&self, attachment: &Attachment) -> Result<Vec<u8>, EmsgError> {
        self.attachments.get_data(attachment)
    }

    // Groups

    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }
}

/// Distinct recipient domains of `to ∪ cc`, in deterministic order.
fn recipient_domains(message: &Message) -> BTreeSet<String> {
    message
        .recipients()
        .iter()
        .filter_map(|recipient| extract_domain(recipient).ok())
        .collect()
}

#[cfg(test)]
mod tests;
