use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Retry behavior for authenticated HTTP requests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub retry_on_429: bool,
    pub retry_on_timeout: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retry_on_429: true,
            retry_on_timeout: true,
        }
    }
}

impl RetryStrategy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.backoff_factor,
            self.max_delay,
            attempt,
        )
    }
}

/// Retry behavior for the per-message delivery tracker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeliveryRetryStrategy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub expiration_time: Duration,
    pub retry_on_failure: bool,
    pub retry_on_timeout: bool,
}

impl Default for DeliveryRetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5 * 60),
            backoff_factor: 2.0,
            expiration_time: Duration::from_secs(24 * 60 * 60),
            retry_on_failure: true,
            retry_on_timeout: true,
        }
    }
}

impl DeliveryRetryStrategy {
    /// Delay before the retry following `attempt_count` attempts (1-based).
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.backoff_factor,
            self.max_delay,
            attempt_count.saturating_sub(1),
        )
    }
}

/// Reconnect behavior for the real-time stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReconnectStrategy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub enabled: bool,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            enabled: true,
        }
    }
}

impl ReconnectStrategy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.backoff_factor,
            self.max_delay,
            attempt,
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AttachmentConfig {
    pub max_file_size: u64,
    pub max_chunk_size: u64,
    pub inline_limit: u64,
    /// Allowed MIME types; empty means everything is allowed.
    pub allowed_types: Vec<String>,
    pub storage_dir: Option<PathBuf>,
    pub enable_chunking: bool,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            max_chunk_size: 1024 * 1024,
            inline_limit: 1024 * 1024,
            allowed_types: Vec::new(),
            storage_dir: None,
            enable_chunking: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
    pub queue_capacity: usize,
    pub reconnect: ReconnectStrategy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: 1024 * 1024,
            queue_capacity: 100,
            reconnect: ReconnectStrategy::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub resolver: ResolverConfig,
    pub dns_ttl: Duration,
    pub retry: RetryStrategy,
    pub enable_notifications: bool,
    pub poll_interval: Duration,
    pub max_concurrent_handlers: usize,
    pub enable_delivery_tracking: bool,
    pub delivery: DeliveryRetryStrategy,
    pub stream: StreamConfig,
    pub attachments: AttachmentConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "emsg-client/0.1".to_string(),
            resolver: ResolverConfig::default(),
            dns_ttl: Duration::from_secs(5 * 60),
            retry: RetryStrategy::default(),
            enable_notifications: false,
            poll_interval: Duration::from_secs(30),
            max_concurrent_handlers: 10,
            enable_delivery_tracking: false,
            delivery: DeliveryRetryStrategy::default(),
            stream: StreamConfig::default(),
            attachments: AttachmentConfig::default(),
        }
    }
}

pub(crate) fn backoff_delay(
    initial: Duration,
    factor: f64,
    cap: Duration,
    exponent: u32,
) -> Duration {
    let scaled = initial.as_secs_f64() * factor.powi(exponent.min(64) as i32);
    Duration::from_secs_f64(scaled.min(cap.as_secs_f64()))
}
