use crate::keys::{public_key_from_base64, verify_detached, KeyPair};
use crate::time::now_secs;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Maximum tolerated clock skew between client and verifier, in seconds.
pub const MAX_TIMESTAMP_SKEW: i64 = 300;

const HEADER_SCHEME: &str = "EMSG ";
const NONCE_BYTES: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing EMSG prefix")]
    MissingPrefix,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(String),
    #[error("invalid public key")]
    KeyInvalid,
    #[error("invalid signature encoding")]
    SignatureEncoding,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("timestamp skew of {0}s exceeds limit")]
    TimestampSkew(i64),
}

/// The byte sequence signed for one request: `METHOD:PATH:TIMESTAMP:NONCE`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthPayload {
    pub method: String,
    pub path: String,
    pub timestamp: i64,
    pub nonce: String,
}

impl AuthPayload {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            timestamp: now_secs(),
            nonce: generate_nonce(),
        }
    }
}

impl Display for AuthPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.method, self.path, self.timestamp, self.nonce
        )
    }
}

pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthHeader {
    pub public_key: String,
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

impl AuthHeader {
    pub fn generate(key_pair: &KeyPair, method: &str, path: &str) -> Self {
        let payload = AuthPayload::new(method, path);
        let signature = key_pair.sign(payload.to_string().as_bytes());
        Self {
            public_key: key_pair.public_key_base64(),
            signature: STANDARD.encode(signature),
            timestamp: payload.timestamp,
            nonce: payload.nonce,
        }
    }

    pub fn header_value(&self) -> String {
        format!(
            "{}pubkey={},signature={},timestamp={},nonce={}",
            HEADER_SCHEME, self.public_key, self.signature, self.timestamp, self.nonce
        )
    }

    /// Parses an `Authorization` header value. Whitespace around the
    /// comma-separated pairs is tolerated; missing fields are not.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let params = value
            .strip_prefix(HEADER_SCHEME)
            .ok_or(AuthError::MissingPrefix)?;

        let mut public_key = None;
        let mut signature = None;
        let mut timestamp = None;
        let mut nonce = None;
        for pair in params.split(',') {
            let Some((key, val)) = pair.split_once('=') else {
                continue;
            };
            let val = val.trim();
            match key.trim() {
                "pubkey" => public_key = Some(val.to_string()),
                "signature" => signature = Some(val.to_string()),
                "timestamp" => {
                    let parsed = val
                        .parse::<i64>()
                        .map_err(|_| AuthError::InvalidTimestamp(val.to_string()))?;
                    timestamp = Some(parsed);
                }
                "nonce" => nonce = Some(val.to_string()),
                _ => {}
            }
        }

        let header = Self {
            public_key: public_key.ok_or(AuthError::MissingField("pubkey"))?,
            signature: signature.ok_or(AuthError::MissingField("signature"))?,
            timestamp: timestamp.ok_or(AuthError::MissingField("timestamp"))?,
            nonce: nonce.ok_or(AuthError::MissingField("nonce"))?,
        };
        if header.public_key.is_empty() {
            return Err(AuthError::MissingField("pubkey"));
        }
        if header.signature.is_empty() {
            return Err(AuthError::MissingField("signature"));
        }
        if header.nonce.is_empty() {
            return Err(AuthError::MissingField("nonce"));
        }
        Ok(header)
    }

    /// Verifies the header against the request it claims to authenticate.
    pub fn verify(&self, method: &str, path: &str) -> Result<(), AuthError> {
        let payload = AuthPayload {
            method: method.to_uppercase(),
            path: path.to_string(),
            timestamp: self.timestamp,
            nonce: self.nonce.clone(),
        };
        let public_key =
            public_key_from_base64(&self.public_key).map_err(|_| AuthError::KeyInvalid)?;
        let signature = STANDARD
            .decode(&self.signature)
            .map_err(|_| AuthError::SignatureEncoding)?;
        if !verify_detached(&public_key, payload.to_string().as_bytes(), &signature) {
            return Err(AuthError::SignatureInvalid);
        }
        let skew = (now_secs() - self.timestamp).abs();
        if skew > MAX_TIMESTAMP_SKEW {
            return Err(AuthError::TimestampSkew(skew));
        }
        Ok(())
    }
}
