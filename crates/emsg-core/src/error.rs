use crate::auth::AuthError;
use crate::dns::DiscoveryError;
use emsg_api::AddressError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmsgError>;

#[derive(Debug, Error)]
pub enum EmsgError {
    #[error("address: {0}")]
    Address(#[from] AddressError),
    #[error("validation: {0}")]
    Validation(String),
    #[error("crypto: {0}")]
    Crypto(String),
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
    #[error("discovery: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("request timeout")]
    Timeout,
    #[error("transport: {0}")]
    Transport(String),
    #[error("send buffer full")]
    BufferFull,
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("state: {0}")]
    State(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for EmsgError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EmsgError::Timeout
        } else {
            EmsgError::Transport(err.to_string())
        }
    }
}
