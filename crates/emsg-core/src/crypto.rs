use crate::error::EmsgError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use x25519_dalek::{PublicKey, StaticSecret};

pub const ENC_KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 24;

const WRAP_CONTEXT: &[u8] = b"emsg:wrapped-content-key:v1";

/// X25519 key pair used for message encryption, distinct from signing keys.
#[derive(Clone)]
pub struct EncryptionKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

/// A content key wrapped for one recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub recipient: String,
    pub nonce: [u8; NONCE_LENGTH],
    pub wrapped_key: Vec<u8>,
}

/// Ciphertext envelope embedded verbatim in an encrypted message body.
/// The body is sealed once under a random content key; `keys` carries that
/// key wrapped for every recipient, so each of them can open it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub nonce: [u8; NONCE_LENGTH],
    pub ciphertext: Vec<u8>,
    pub sender_public_key: [u8; ENC_KEY_LENGTH],
    pub keys: Vec<WrappedKey>,
}

impl EncryptionKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; ENC_KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_base64(public_b64: &str, secret_b64: &str) -> Result<Self, EmsgError> {
        let secret = decode_key(secret_b64)?;
        let pair = Self::from_secret_bytes(secret);
        let public = decode_key(public_b64)?;
        if pair.public.as_bytes() != &public {
            return Err(EmsgError::Crypto("public key does not match secret".to_string()));
        }
        Ok(pair)
    }

    pub fn public_key_bytes(&self) -> [u8; ENC_KEY_LENGTH] {
        *self.public.as_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    pub fn secret_key_base64(&self) -> String {
        STANDARD.encode(self.secret.to_bytes())
    }

    /// Seals `plaintext` for every listed recipient. The body is encrypted
    /// once with a random content key, which is then wrapped per recipient
    /// via X25519 ECDH and HKDF-SHA256.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        recipients: &[(String, [u8; ENC_KEY_LENGTH])],
    ) -> Result<EncryptedMessage, EmsgError> {
        if recipients.is_empty() {
            return Err(EmsgError::Crypto("no recipients".to_string()));
        }
        let mut content_key = [0u8; ENC_KEY_LENGTH];
        OsRng.fill_bytes(&mut content_key);
        let nonce = random_nonce();

        let cipher = XChaCha20Poly1305::new_from_slice(&content_key)
            .map_err(|_| EmsgError::Crypto("content key".to_string()))?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| EmsgError::Crypto("seal body".to_string()))?;

        let mut keys = Vec::with_capacity(recipients.len());
        for (address, recipient_public) in recipients {
            let wrap_key = self.derive_wrap_key(recipient_public)?;
            let wrap_nonce = random_nonce();
            let wrap_cipher = XChaCha20Poly1305::new_from_slice(&wrap_key)
                .map_err(|_| EmsgError::Crypto("wrap key".to_string()))?;
            let wrapped_key = wrap_cipher
                .encrypt(XNonce::from_slice(&wrap_nonce), content_key.as_slice())
                .map_err(|_| EmsgError::Crypto("wrap content key".to_string()))?;
            keys.push(WrappedKey {
                recipient: address.clone(),
                nonce: wrap_nonce,
                wrapped_key,
            });
        }

        Ok(EncryptedMessage {
            nonce,
            ciphertext,
            sender_public_key: self.public_key_bytes(),
            keys,
        })
    }

    /// Opens an envelope by trying each wrapped key; authentication fails
    /// cleanly for entries not addressed to this key pair.
    pub fn decrypt(&self, envelope: &EncryptedMessage) -> Result<Vec<u8>, EmsgError> {
        let sender = PublicKey::from(envelope.sender_public_key);
        let shared = self.secret.diffie_hellman(&sender).to_bytes();
        let wrap_key = derive_aead_key(shared)?;
        let wrap_cipher = XChaCha20Poly1305::new_from_slice(&wrap_key)
            .map_err(|_| EmsgError::Crypto("wrap key".to_string()))?;

        for wrapped in &envelope.keys {
            let Ok(content_key) = wrap_cipher.decrypt(
                XNonce::from_slice(&wrapped.nonce),
                wrapped.wrapped_key.as_slice(),
            ) else {
                continue;
            };
            let cipher = XChaCha20Poly1305::new_from_slice(&content_key)
                .map_err(|_| EmsgError::Crypto("content key".to_string()))?;
            return cipher
                .decrypt(
                    XNonce::from_slice(&envelope.nonce),
                    envelope.ciphertext.as_slice(),
                )
                .map_err(|_| EmsgError::Crypto("authentication failed".to_string()));
        }
        Err(EmsgError::Crypto("no wrapped key opened".to_string()))
    }

    fn derive_wrap_key(
        &self,
        recipient_public: &[u8; ENC_KEY_LENGTH],
    ) -> Result<[u8; ENC_KEY_LENGTH], EmsgError> {
        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(*recipient_public))
            .to_bytes();
        derive_aead_key(shared)
    }
}

fn derive_aead_key(shared_secret: [u8; 32]) -> Result<[u8; ENC_KEY_LENGTH], EmsgError> {
    let hkdf = Hkdf::<Sha256>::new(None, &shared_secret);
    let mut out = [0u8; ENC_KEY_LENGTH];
    hkdf.expand(WRAP_CONTEXT, &mut out)
        .map_err(|_| EmsgError::Crypto("derive".to_string()))?;
    Ok(out)
}

fn random_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn decode_key(encoded: &str) -> Result<[u8; ENC_KEY_LENGTH], EmsgError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| EmsgError::Crypto(format!("key base64: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        EmsgError::Crypto(format!(
            "key length: expected {}, got {}",
            ENC_KEY_LENGTH,
            b.len()
        ))
    })
}

/// Registry of recipient encryption public keys.
pub trait KeyStore: Send + Sync {
    fn store_public_key(
        &self,
        address: &str,
        public_key: [u8; ENC_KEY_LENGTH],
    ) -> Result<(), EmsgError>;
    fn get_public_key(&self, address: &str) -> Result<[u8; ENC_KEY_LENGTH], EmsgError>;
    fn has_public_key(&self, address: &str) -> bool;
}

#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, [u8; ENC_KEY_LENGTH]>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn store_public_key(
        &self,
        address: &str,
        public_key: [u8; ENC_KEY_LENGTH],
    ) -> Result<(), EmsgError> {
        self.keys
            .write()
            .expect("key store lock")
            .insert(address.to_string(), public_key);
        Ok(())
    }

    fn get_public_key(&self, address: &str) -> Result<[u8; ENC_KEY_LENGTH], EmsgError> {
        self.keys
            .read()
            .expect("key store lock")
            .get(address)
            .copied()
            .ok_or_else(|| EmsgError::NotFound(format!("public key for {address}")))
    }

    fn has_public_key(&self, address: &str) -> bool {
        self.keys.read().expect("key store lock").contains_key(address)
    }
}

/// Owns the local encryption key pair and the recipient key registry.
pub struct EncryptionManager {
    key_pair: EncryptionKeyPair,
    store: Arc<dyn KeyStore>,
}

impl EncryptionManager {
    pub fn new(key_pair: EncryptionKeyPair, store: Arc<dyn KeyStore>) -> Self {
        Self { key_pair, store }
    }

    pub fn encrypt_for_recipient(
        &self,
        plaintext: &[u8],
        address: &str,
    ) -> Result<EncryptedMessage, EmsgError> {
        self.encrypt_for_recipients(plaintext, &[address.to_string()])
    }

    pub fn encrypt_for_recipients(
        &self,
        plaintext: &[u8],
        addresses: &[String],
    ) -> Result<EncryptedMessage, EmsgError> {
        let mut recipients = Vec::with_capacity(addresses.len());
        for address in addresses {
            recipients.push((address.clone(), self.store.get_public_key(address)?));
        }
        self.key_pair.encrypt(plaintext, &recipients)
    }

    pub fn decrypt_message(&self, envelope: &EncryptedMessage) -> Result<Vec<u8>, EmsgError> {
        self.key_pair.decrypt(envelope)
    }

    pub fn can_encrypt_for(&self, address: &str) -> bool {
        self.store.has_public_key(address)
    }

    pub fn public_key_bytes(&self) -> [u8; ENC_KEY_LENGTH] {
        self.key_pair.public_key_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        self.key_pair.public_key_base64()
    }

    pub fn register_public_key(&self, address: &str, public_b64: &str) -> Result<(), EmsgError> {
        let key = decode_key(public_b64)?;
        self.store.store_public_key(address, key)
    }
}
