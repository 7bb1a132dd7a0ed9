use crate::config::DeliveryRetryStrategy;
use crate::error::EmsgError;
use crate::message::Message;
use crate::time::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Retrying,
    Expired,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Expired
        )
    }
}

/// One message's progress through the delivery state machine. Timing fields
/// are epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub timestamp: i64,
    pub created_at: i64,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub last_attempt: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl DeliveryReceipt {
    pub fn to_json(&self) -> Result<Vec<u8>, EmsgError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, EmsgError> {
        Ok(serde_json::from_slice(data)?)
    }
}

pub type DeliveryCallback = Arc<dyn Fn(&DeliveryReceipt) + Send + Sync>;

/// Tracks receipts and schedules retries. Receipts and callback registrations
/// live under separate locks so callback dispatch never holds the receipts
/// map.
pub struct DeliveryTracker {
    receipts: Mutex<HashMap<String, DeliveryReceipt>>,
    callbacks: Mutex<CallbackRegistry>,
    strategy: DeliveryRetryStrategy,
}

#[derive(Default)]
struct CallbackRegistry {
    per_message: HashMap<String, Vec<DeliveryCallback>>,
    global: Vec<DeliveryCallback>,
}

impl DeliveryTracker {
    pub fn new(strategy: DeliveryRetryStrategy) -> Self {
        Self {
            receipts: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(CallbackRegistry::default()),
            strategy,
        }
    }

    pub fn strategy(&self) -> &DeliveryRetryStrategy {
        &self.strategy
    }

    /// Inserts a `pending` receipt keyed by the message id.
    pub fn track(&self, message: &Message) -> DeliveryReceipt {
        let now = now_ms();
        let mut metadata = Map::new();
        metadata.insert("from".to_string(), Value::String(message.from.clone()));
        if !message.subject.is_empty() {
            metadata.insert("subject".to_string(), Value::String(message.subject.clone()));
        }
        metadata.insert(
            "recipients".to_string(),
            Value::Array(
                message
                    .recipients()
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
        );
        metadata.insert("is_system".to_string(), Value::Bool(message.is_system()));
        metadata.insert("is_encrypted".to_string(), Value::Bool(message.is_encrypted()));

        let receipt = DeliveryReceipt {
            message_id: message.message_id.clone(),
            recipient: message.to.first().cloned().unwrap_or_default(),
            status: DeliveryStatus::Pending,
            timestamp: now,
            created_at: now,
            attempt_count: 0,
            last_attempt: 0,
            next_attempt: None,
            error_message: String::new(),
            metadata,
        };
        self.receipts
            .lock()
            .expect("receipts lock")
            .insert(message.message_id.clone(), receipt.clone());
        receipt
    }

    /// Advances the state machine. Updates on terminal receipts are silent
    /// no-ops; transitions outside the table are state errors.
    pub fn update_status(
        &self,
        message_id: &str,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<(), EmsgError> {
        let emitted = {
            let mut receipts = self.receipts.lock().expect("receipts lock");
            let receipt = receipts
                .get_mut(message_id)
                .ok_or_else(|| EmsgError::NotFound(format!("receipt {message_id}")))?;

            let old = receipt.status;
            if old.is_terminal() {
                log::debug!("receipt {message_id} already {old:?}, ignoring {status:?}");
                return Ok(());
            }
            if !transition_allowed(old, status) {
                return Err(EmsgError::State(format!(
                    "illegal delivery transition {old:?} -> {status:?}"
                )));
            }

            let now = now_ms();
            receipt.status = status;
            receipt.timestamp = now;
            if let Some(error) = error {
                receipt.error_message = error.to_string();
            }
            if matches!(status, DeliveryStatus::Sent | DeliveryStatus::Retrying) {
                receipt.attempt_count += 1;
                receipt.last_attempt = now;
                receipt.next_attempt = None;
                if status == DeliveryStatus::Retrying
                    && receipt.attempt_count < self.strategy.max_retries
                {
                    let delay = self.strategy.delay_for_attempt(receipt.attempt_count);
                    receipt.next_attempt = Some(now + delay.as_millis() as i64);
                }
            }
            if now - receipt.created_at > self.strategy.expiration_time.as_millis() as i64 {
                receipt.status = DeliveryStatus::Expired;
            }

            let crossed_terminal = !old.is_terminal() && receipt.status.is_terminal();
            crossed_terminal.then(|| receipt.clone())
        };

        if let Some(receipt) = emitted {
            self.dispatch_callbacks(receipt);
        }
        Ok(())
    }

    pub fn get_receipt(&self, message_id: &str) -> Result<DeliveryReceipt, EmsgError> {
        self.receipts
            .lock()
            .expect("receipts lock")
            .get(message_id)
            .cloned()
            .ok_or_else(|| EmsgError::NotFound(format!("receipt {message_id}")))
    }

    /// Receipts in `retrying` whose next attempt is due and which are still
    /// under the retry cap and the expiration window.
    pub fn get_pending_retries(&self) -> Vec<DeliveryReceipt> {
        let now = now_ms();
        let expiration = self.strategy.expiration_time.as_millis() as i64;
        self.receipts
            .lock()
            .expect("receipts lock")
            .values()
            .filter(|r| {
                r.status == DeliveryStatus::Retrying
                    && r.next_attempt.map(|t| t <= now).unwrap_or(false)
                    && r.attempt_count < self.strategy.max_retries
                    && now - r.created_at <= expiration
            })
            .cloned()
            .collect()
    }

    pub fn should_retry(&self, message_id: &str, error: &EmsgError) -> bool {
        let receipts = self.receipts.lock().expect("receipts lock");
        let Some(receipt) = receipts.get(message_id) else {
            return false;
        };
        if receipt.attempt_count >= self.strategy.max_retries {
            return false;
        }
        if now_ms() - receipt.created_at > self.strategy.expiration_time.as_millis() as i64 {
            return false;
        }
        let text = error.to_string();
        if self.strategy.retry_on_timeout
            && (text.contains("timeout") || text.contains("deadline exceeded"))
        {
            return true;
        }
        self.strategy.retry_on_failure
    }

    pub fn register_callback(&self, message_id: &str, callback: DeliveryCallback) {
        self.callbacks
            .lock()
            .expect("callbacks lock")
            .per_message
            .entry(message_id.to_string())
            .or_default()
            .push(callback);
    }

    pub fn register_global_callback(&self, callback: DeliveryCallback) {
        self.callbacks
            .lock()
            .expect("callbacks lock")
            .global
            .push(callback);
    }

    /// Removes receipts older than the expiration window.
    pub fn cleanup_expired(&self) -> usize {
        let now = now_ms();
        let expiration = self.strategy.expiration_time.as_millis() as i64;
        let mut receipts = self.receipts.lock().expect("receipts lock");
        let before = receipts.len();
        receipts.retain(|_, r| now - r.created_at <= expiration);
        before - receipts.len()
    }

    pub fn get_stats(&self) -> HashMap<DeliveryStatus, usize> {
        let receipts = self.receipts.lock().expect("receipts lock");
        let mut stats = HashMap::new();
        for receipt in receipts.values() {
            *stats.entry(receipt.status).or_insert(0) += 1;
        }
        stats
    }

    pub fn all_receipts(&self) -> Vec<DeliveryReceipt> {
        self.receipts
            .lock()
            .expect("receipts lock")
            .values()
            .cloned()
            .collect()
    }

    /// Each callback runs in its own task behind a panic barrier, so one
    /// handler cannot take down the others.
    fn dispatch_callbacks(&self, receipt: DeliveryReceipt) {
        let callbacks: Vec<DeliveryCallback> = {
            let registry = self.callbacks.lock().expect("callbacks lock");
            registry
                .per_message
                .get(&receipt.message_id)
                .into_iter()
                .flatten()
                .chain(registry.global.iter())
                .cloned()
                .collect()
        };
        for callback in callbacks {
            let receipt = receipt.clone();
            tokio::spawn(async move {
                if catch_unwind(AssertUnwindSafe(|| callback(&receipt))).is_err() {
                    log::warn!("delivery callback panicked");
                }
            });
        }
    }
}

fn transition_allowed(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    use DeliveryStatus::*;
    matches!(
        (from, to),
        (Pending, Sent)
            | (Pending, Failed)
            | (Sent, Delivered)
            | (Sent, Retrying)
            | (Retrying, Sent)
            | (Retrying, Failed)
    ) || (to == Expired && !from.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_exhaustive() {
        use DeliveryStatus::*;
        assert!(transition_allowed(Pending, Sent));
        assert!(transition_allowed(Pending, Failed));
        assert!(transition_allowed(Sent, Delivered));
        assert!(transition_allowed(Sent, Retrying));
        assert!(transition_allowed(Retrying, Sent));
        assert!(transition_allowed(Retrying, Failed));
        assert!(transition_allowed(Pending, Expired));
        assert!(transition_allowed(Sent, Expired));
        assert!(transition_allowed(Retrying, Expired));

        assert!(!transition_allowed(Pending, Delivered));
        assert!(!transition_allowed(Pending, Retrying));
        assert!(!transition_allowed(Sent, Failed));
        assert!(!transition_allowed(Delivered, Expired));
        assert!(!transition_allowed(Failed, Sent));
        assert!(!transition_allowed(Expired, Pending));
    }

    #[test]
    fn receipt_json_roundtrip() {
        let receipt = DeliveryReceipt {
            message_id: "m1".to_string(),
            recipient: "bob#test.org".to_string(),
            status: DeliveryStatus::Retrying,
            timestamp: 1_700_000_000_000,
            created_at: 1_700_000_000_000,
            attempt_count: 2,
            last_attempt: 1_700_000_001_000,
            next_attempt: Some(1_700_000_005_000),
            error_message: "timeout".to_string(),
            metadata: Map::new(),
        };
        let encoded = receipt.to_json().expect("serialize");
        let decoded = DeliveryReceipt::from_json(&encoded).expect("deserialize");
        assert_eq!(decoded, receipt);
    }
}
