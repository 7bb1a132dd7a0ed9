use crate::config::ResolverConfig;
use async_trait::async_trait;
use emsg_api::{Address, DNS_PREFIX};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("empty domain")]
    EmptyDomain,
    #[error("txt lookup for {0} failed: {1}")]
    Lookup(String, String),
    #[error("no TXT records found for {0}")]
    NoRecords(String),
    #[error("no parseable server record for {0}")]
    UnparseableRecords(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

/// Server endpoint advertised in a `_emsg.<domain>` TXT record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub url: String,
    #[serde(rename = "pubkey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// TXT record source, kept behind a trait so tests never hit the network.
#[async_trait]
pub trait TxtLookup: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DiscoveryError>;
}

pub struct SystemTxtLookup {
    resolver: hickory_resolver::TokioAsyncResolver,
}

impl SystemTxtLookup {
    pub fn new() -> Result<Self, DiscoveryError> {
        let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| DiscoveryError::Lookup("system".to_string(), e.to_string()))?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl TxtLookup for SystemTxtLookup {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DiscoveryError> {
        let response = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| DiscoveryError::Lookup(name.to_string(), e.to_string()))?;
        let records = response
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .concat()
            })
            .collect();
        Ok(records)
    }
}

/// Fixed record set for tests and offline use.
#[derive(Default)]
pub struct StaticTxtLookup {
    records: HashMap<String, Vec<String>>,
}

impl StaticTxtLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, name: &str, record: &str) -> Self {
        self.records
            .entry(name.to_string())
            .or_default()
            .push(record.to_string());
        self
    }

    pub fn with_records(mut self, name: &str, records: Vec<String>) -> Self {
        self.records.insert(name.to_string(), records);
        self
    }
}

#[async_trait]
impl TxtLookup for StaticTxtLookup {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DiscoveryError> {
        match self.records.get(name) {
            Some(records) => Ok(records.clone()),
            None => Err(DiscoveryError::Lookup(
                name.to_string(),
                "no such name".to_string(),
            )),
        }
    }
}

pub struct Resolver {
    lookup: Arc<dyn TxtLookup>,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(lookup: Arc<dyn TxtLookup>, config: ResolverConfig) -> Self {
        Self { lookup, config }
    }

    pub async fn resolve_domain(&self, domain: &str) -> Result<ServerInfo, DiscoveryError> {
        if domain.is_empty() {
            return Err(DiscoveryError::EmptyDomain);
        }
        let dns_name = format!("{DNS_PREFIX}{domain}");
        let records = self.lookup_with_retries(&dns_name).await?;
        if records.is_empty() {
            return Err(DiscoveryError::NoRecords(dns_name));
        }
        for record in &records {
            if let Ok(info) = parse_txt_record(record) {
                return Ok(info);
            }
        }
        Err(DiscoveryError::UnparseableRecords(dns_name))
    }

    pub async fn resolve_address(&self, address: &Address) -> Result<ServerInfo, DiscoveryError> {
        self.resolve_domain(&address.domain).await
    }

    async fn lookup_with_retries(&self, name: &str) -> Result<Vec<String>, DiscoveryError> {
        let attempts = self.config.retries.max(1);
        let mut last_err = DiscoveryError::NoRecords(name.to_string());
        for i in 0..attempts {
            let lookup = tokio::time::timeout(self.config.timeout, self.lookup.lookup_txt(name));
            match lookup.await {
                Ok(Ok(records)) => return Ok(records),
                Ok(Err(err)) => last_err = err,
                Err(_) => {
                    last_err =
                        DiscoveryError::Lookup(name.to_string(), "timeout".to_string());
                }
            }
            if i + 1 < attempts {
                tokio::time::sleep(Duration::from_secs((i + 1) as u64)).await;
            }
        }
        Err(last_err)
    }
}

/// Parses one TXT record, trying JSON, bare URL, then key=value form.
pub fn parse_txt_record(record: &str) -> Result<ServerInfo, DiscoveryError> {
    let record = record.trim();
    if record.starts_with('{') && record.ends_with('}') {
        return parse_json_record(record);
    }
    if record.starts_with("http://") || record.starts_with("https://") {
        validate_server_url(record)?;
        return Ok(ServerInfo {
            url: record.to_string(),
            public_key: None,
            version: None,
        });
    }
    parse_key_value_record(record)
}

fn parse_json_record(record: &str) -> Result<ServerInfo, DiscoveryError> {
    let info: ServerInfo = serde_json::from_str(record)
        .map_err(|e| DiscoveryError::UnparseableRecords(e.to_string()))?;
    if info.url.is_empty() {
        return Err(DiscoveryError::InvalidUrl("missing url".to_string()));
    }
    validate_server_url(&info.url)?;
    Ok(info)
}

fn parse_key_value_record(record: &str) -> Result<ServerInfo, DiscoveryError> {
    let mut url = None;
    let mut public_key = None;
    let mut version = None;
    for part in record.split_whitespace() {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        // First occurrence of a key wins.
        match key.trim().to_lowercase().as_str() {
            "url" if url.is_none() => url = Some(value.trim().to_string()),
            "pubkey" | "publickey" if public_key.is_none() => {
                public_key = Some(value.trim().to_string())
            }
            "version" if version.is_none() => version = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let url = url.ok_or_else(|| DiscoveryError::InvalidUrl("missing url".to_string()))?;
    validate_server_url(&url)?;
    Ok(ServerInfo {
        url,
        public_key,
        version,
    })
}

pub fn validate_server_url(raw: &str) -> Result<(), DiscoveryError> {
    let parsed = Url::parse(raw).map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(DiscoveryError::InvalidUrl(format!(
            "scheme must be http or https, got {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(DiscoveryError::InvalidUrl("missing host".to_string()));
    }
    Ok(())
}

struct CacheEntry {
    info: ServerInfo,
    inserted_at: Instant,
    ttl: Duration,
}

/// Resolver with a TTL-bounded positive cache. Stale entries are dropped on
/// read; failures are never cached.
pub struct CachedResolver {
    resolver: Resolver,
    cache: Mutex<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
}

impl CachedResolver {
    pub fn new(lookup: Arc<dyn TxtLookup>, config: ResolverConfig, ttl: Duration) -> Self {
        Self {
            resolver: Resolver::new(lookup, config),
            cache: Mutex::new(HashMap::new()),
            default_ttl: ttl,
        }
    }

    pub async fn resolve_domain(&self, domain: &str) -> Result<ServerInfo, DiscoveryError> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(domain) {
                if entry.inserted_at.elapsed() < entry.ttl {
                    return Ok(entry.info.clone());
                }
                cache.remove(domain);
            }
        }
        let info = self.resolver.resolve_domain(domain).await?;
        self.cache.lock().await.insert(
            domain.to_string(),
            CacheEntry {
                info: info.clone(),
                inserted_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
        Ok(info)
    }

    pub async fn resolve_address(&self, address: &Address) -> Result<ServerInfo, DiscoveryError> {
        self.resolve_domain(&address.domain).await
    }
}
