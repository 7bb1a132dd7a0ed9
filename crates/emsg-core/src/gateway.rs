use crate::auth::AuthHeader;
use crate::config::{ClientConfig, RetryStrategy};
use crate::dns::{CachedResolver, ServerInfo, TxtLookup};
use crate::error::EmsgError;
use crate::keys::KeyPair;
use crate::message::Message;
use crate::notify::MessageSource;
use async_trait::async_trait;
use emsg_api::Address;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use url::Url;

pub const USERS_PATH: &str = "/api/v1/users";
pub const MESSAGES_PATH: &str = "/api/v1/messages";

/// Final response of a successful request, retained for the after-send hook.
#[derive(Clone, Debug)]
pub struct ServerResponse {
    pub status: u16,
    pub body: String,
}

/// Authenticated HTTP to discovered servers, with retry on rate limiting
/// and timeouts.
pub struct HttpGateway {
    http: reqwest::Client,
    resolver: CachedResolver,
    key_pair: Arc<KeyPair>,
    retry: RetryStrategy,
}

impl HttpGateway {
    pub fn new(
        config: &ClientConfig,
        key_pair: Arc<KeyPair>,
        lookup: Arc<dyn TxtLookup>,
    ) -> Result<Self, EmsgError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| EmsgError::Transport(format!("http client: {e}")))?;
        Ok(Self {
            http,
            resolver: CachedResolver::new(lookup, config.resolver.clone(), config.dns_ttl),
            key_pair,
            retry: config.retry.clone(),
        })
    }

    pub async fn resolve_domain(&self, domain: &str) -> Result<ServerInfo, EmsgError> {
        Ok(self.resolver.resolve_domain(domain).await?)
    }

    pub async fn register_user(&self, address: &Address) -> Result<ServerResponse, EmsgError> {
        let server = self.resolve_domain(&address.domain).await?;
        let payload = json!({
            "address": address.raw,
            "public_key": self.key_pair.public_key_base64(),
        });
        let endpoint = format!("{}{}", server.url.trim_end_matches('/'), USERS_PATH);
        self.request_with_retry(Method::POST, &endpoint, Some(serde_json::to_vec(&payload)?))
            .await
    }

    pub async fn post_message(
        &self,
        domain: &str,
        message: &Message,
    ) -> Result<ServerResponse, EmsgError> {
        let server = self.resolve_domain(domain).await?;
        let endpoint = format!("{}{}", server.url.trim_end_matches('/'), MESSAGES_PATH);
        self.request_with_retry(Method::POST, &endpoint, Some(message.to_json()?))
            .await
    }

    pub async fn get_messages(&self, address: &Address) -> Result<Vec<Message>, EmsgError> {
        let server = self.resolve_domain(&address.domain).await?;
        let endpoint = format!("{}{}", server.url.trim_end_matches('/'), MESSAGES_PATH);
        let response = self.send_once(Method::GET, &endpoint, None).await?;
        if !(200..300).contains(&response.status) {
            return Err(EmsgError::Http {
                status: response.status,
                body: response.body,
            });
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    /// Issues the request up to `max_retries + 1` times. A fresh auth header
    /// (new timestamp and nonce) is generated per attempt.
    async fn request_with_retry(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ServerResponse, EmsgError> {
        let mut last_err = EmsgError::Transport("request not attempted".to_string());
        for attempt in 0..=self.retry.max_retries {
            match self.send_once(method.clone(), endpoint, body.clone()).await {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) if response.status == 429 => {
                    last_err = EmsgError::Http {
                        status: response.status,
                        body: response.body,
                    };
                    if self.retry.retry_on_429 && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_attempt(attempt);
                        log::warn!(
                            "rate limited (429), retrying in {:?} (attempt {}/{})",
                            delay,
                            attempt + 1,
                            self.retry.max_retries + 1
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(last_err);
                }
                Ok(response) => {
                    return Err(EmsgError::Http {
                        status: response.status,
                        body: response.body,
                    });
                }
                Err(err @ EmsgError::Timeout) => {
                    last_err = err;
                    if self.retry.retry_on_timeout && attempt < self.retry.max_retries {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(last_err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn send_once(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ServerResponse, EmsgError> {
        let path = Url::parse(endpoint)
            .map_err(|e| EmsgError::Validation(format!("endpoint url: {e}")))?
            .path()
            .to_string();
        let auth = AuthHeader::generate(&self.key_pair, method.as_str(), &path);

        let mut request = self.http.request(method, endpoint).header(
            AUTHORIZATION,
            HeaderValue::from_str(&auth.header_value())
                .map_err(|e| EmsgError::Transport(format!("auth header: {e}")))?,
        );
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(ServerResponse { status, body })
    }
}

#[async_trait]
impl MessageSource for HttpGateway {
    async fn fetch_messages(&self, address: &str) -> Result<Vec<Message>, EmsgError> {
        let address = Address::parse(address)?;
        self.get_messages(&address).await
    }
}
