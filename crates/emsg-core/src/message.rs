use crate::attachments::{Attachment, AttachmentManager};
use crate::crypto::{EncryptedMessage, EncryptionManager};
use crate::error::EmsgError;
use crate::keys::{public_key_from_base64, verify_detached, KeyPair};
use crate::time::now_secs;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use emsg_api::{is_valid_address, validate_address_list};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

pub const SYSTEM_PREFIX: &str = "system:";
pub const GROUP_PREFIX: &str = "group:";

pub const SYSTEM_JOINED: &str = "system:joined";
pub const SYSTEM_LEFT: &str = "system:left";
pub const SYSTEM_REMOVED: &str = "system:removed";
pub const SYSTEM_ADMIN_CHANGED: &str = "system:admin_changed";
pub const SYSTEM_GROUP_CREATED: &str = "system:group_created";

const MESSAGE_ID_BYTES: usize = 16;

/// An EMSG message. Immutable after build except for `signature`, set once.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// Structured body of a `system:*` or `group:*` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub actor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub timestamp: i64,
}

impl Message {
    /// Canonical signing payload: the message serialized with the signature
    /// field blanked (and therefore absent from the encoding).
    pub fn signing_payload(&self) -> Result<Vec<u8>, EmsgError> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<(), EmsgError> {
        let payload = self.signing_payload()?;
        self.signature = STANDARD.encode(key_pair.sign(&payload));
        Ok(())
    }

    pub fn verify(&self, public_key_b64: &str) -> Result<(), EmsgError> {
        if self.signature.is_empty() {
            return Err(EmsgError::Validation("message is not signed".to_string()));
        }
        let public_key = public_key_from_base64(public_key_b64)?;
        let payload = self.signing_payload()?;
        let signature = STANDARD
            .decode(&self.signature)
            .map_err(|e| EmsgError::Validation(format!("signature base64: {e}")))?;
        if !verify_detached(&public_key, &payload, &signature) {
            return Err(EmsgError::SignatureInvalid);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EmsgError> {
        if self.from.is_empty() {
            return Err(EmsgError::Validation("from address is required".to_string()));
        }
        if !is_valid_address(&self.from) {
            return Err(EmsgError::Validation(format!(
                "invalid from address: {}",
                self.from
            )));
        }
        if self.to.is_empty() {
            return Err(EmsgError::Validation(
                "at least one recipient is required".to_string(),
            ));
        }
        validate_address_list(&self.to)?;
        validate_address_list(&self.cc)?;
        if self.body.is_empty() {
            return Err(EmsgError::Validation("message body is required".to_string()));
        }
        if self.timestamp <= 0 {
            return Err(EmsgError::Validation("invalid timestamp".to_string()));
        }
        if self.is_system() {
            let system = self.system_message()?;
            if system.kind != self.kind {
                return Err(EmsgError::Validation(format!(
                    "system message type mismatch: body has {}, message has {}",
                    system.kind, self.kind
                )));
            }
        }
        Ok(())
    }

    /// All recipients, `to` followed by `cc`.
    pub fn recipients(&self) -> Vec<String> {
        let mut recipients = Vec::with_capacity(self.to.len() + self.cc.len());
        recipients.extend(self.to.iter().cloned());
        recipients.extend(self.cc.iter().cloned());
        recipients
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    pub fn is_system(&self) -> bool {
        self.kind.starts_with(SYSTEM_PREFIX) || self.kind.starts_with(GROUP_PREFIX)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn system_message(&self) -> Result<SystemMessage, EmsgError> {
        serde_json::from_str(&self.body)
            .map_err(|e| EmsgError::Protocol(format!("system message body: {e}")))
    }

    /// The ciphertext envelope held in the body of an encrypted message.
    pub fn envelope(&self) -> Result<EncryptedMessage, EmsgError> {
        if !self.encrypted {
            return Err(EmsgError::Validation("message is not encrypted".to_string()));
        }
        serde_json::from_str(&self.body)
            .map_err(|e| EmsgError::Protocol(format!("ciphertext envelope: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EmsgError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, EmsgError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Derives the content-addressed message id:
/// URL-safe base64 of the first 16 bytes of
/// `SHA-256(from ":" to.join(",") ":" body ":" timestamp)`.
pub fn derive_message_id(from: &str, to: &[String], body: &str, timestamp: i64) -> String {
    let content = format!("{}:{}:{}:{}", from, to.join(","), body, timestamp);
    let hash = Sha256::digest(content.as_bytes());
    URL_SAFE.encode(&hash[..MESSAGE_ID_BYTES])
}

/// Accumulates message fields; `build` runs the encryption pass, validates,
/// and fills in the message id.
pub struct MessageBuilder {
    message: Message,
    encryption: Option<Arc<EncryptionManager>>,
    attachments: Option<Arc<AttachmentManager>>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self {
            message: Message {
                timestamp: now_secs(),
                ..Message::default()
            },
            encryption: None,
            attachments: None,
        }
    }

    pub fn from(mut self, address: &str) -> Self {
        self.message.from = address.to_string();
        self
    }

    pub fn to<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message.to = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn cc<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message.cc = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.message.subject = subject.to_string();
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.message.body = body.to_string();
        self
    }

    pub fn group_id(mut self, group_id: &str) -> Self {
        self.message.group_id = group_id.to_string();
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.message.kind = kind.to_string();
        self
    }

    pub fn message_id(mut self, message_id: &str) -> Self {
        self.message.message_id = message_id.to_string();
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.message.timestamp = timestamp;
        self
    }

    pub fn with_encryption(mut self, manager: Arc<EncryptionManager>) -> Self {
        self.encryption = Some(manager);
        self
    }

    pub fn with_attachment_manager(mut self, manager: Arc<AttachmentManager>) -> Self {
        self.attachments = Some(manager);
        self
    }

    pub fn attach_file(mut self, path: impl AsRef<Path>) -> Result<Self, EmsgError> {
        let manager = self
            .attachments
            .as_ref()
            .ok_or_else(|| EmsgError::State("attachment manager not set".to_string()))?;
        let attachment = manager.create_from_file(path)?;
        self.message.attachments.push(attachment);
        Ok(self)
    }

    pub fn attach_data(
        mut self,
        name: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<Self, EmsgError> {
        let manager = self
            .attachments
            .as_ref()
            .ok_or_else(|| EmsgError::State("attachment manager not set".to_string()))?;
        let attachment = manager.create_from_data(name, data, mime_type)?;
        self.message.attachments.push(attachment);
        Ok(self)
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.message.attachments.push(attachment);
        self
    }

    pub fn build(mut self) -> Result<Message, EmsgError> {
        if self.encryption.is_some() && !self.message.body.is_empty() {
            self.encrypt_body()?;
        }
        self.message.validate()?;
        if self.message.message_id.is_empty() {
            self.message.message_id = derive_message_id(
                &self.message.from,
                &self.message.to,
                &self.message.body,
                self.message.timestamp,
            );
        }
        Ok(self.message)
    }

    /// Replaces the body with a serialized envelope when every recipient has
    /// a registered key; otherwise the message goes out unencrypted.
    fn encrypt_body(&mut self) -> Result<(), EmsgError> {
        let Some(manager) = self.encryption.as_ref() else {
            return Ok(());
        };
        let recipients = self.message.recipients();
        if recipients.is_empty() {
            return Ok(());
        }
        if !recipients.iter().all(|r| manager.can_encrypt_for(r)) {
            log::debug!("missing recipient keys, sending unencrypted");
            return Ok(());
        }
        let envelope = manager.encrypt_for_recipients(self.message.body.as_bytes(), &recipients)?;
        self.message.body = serde_json::to_string(&envelope)?;
        self.message.encrypted = true;
        self.message.encryption_key = manager.public_key_base64();
        Ok(())
    }
}

/// Builds a regular message whose body is a serialized [`SystemMessage`].
pub struct SystemMessageBuilder {
    system: SystemMessage,
}

impl SystemMessageBuilder {
    pub fn new() -> Self {
        Self {
            system: SystemMessage {
                kind: String::new(),
                actor: String::new(),
                target: String::new(),
                group_id: String::new(),
                metadata: Map::new(),
                timestamp: now_secs(),
            },
        }
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.system.kind = kind.to_string();
        self
    }

    pub fn actor(mut self, actor: &str) -> Self {
        self.system.actor = actor.to_string();
        self
    }

    pub fn target(mut self, target: &str) -> Self {
        self.system.target = target.to_string();
        self
    }

    pub fn group_id(mut self, group_id: &str) -> Self {
        self.system.group_id = group_id.to_string();
        self
    }

    pub fn metadata(mut self, key: &str, value: Value) -> Self {
        self.system.metadata.insert(key.to_string(), value);
        self
    }

    pub fn build(self, from: &str, to: Vec<String>) -> Result<Message, EmsgError> {
        if self.system.kind.is_empty() {
            return Err(EmsgError::Validation(
                "system message type is required".to_string(),
            ));
        }
        let body = serde_json::to_string(&self.system)?;
        let message_id = derive_message_id(from, &to, &body, self.system.timestamp);
        Ok(Message {
            from: from.to_string(),
            to,
            body,
            kind: self.system.kind.clone(),
            group_id: self.system.group_id.clone(),
            timestamp: self.system.timestamp,
            message_id,
            ..Message::default()
        })
    }
}

impl Default for SystemMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
