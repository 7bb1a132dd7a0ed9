use crate::error::EmsgError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const PRIVATE_KEY_LENGTH: usize = 64;
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 signing key pair. The public half travels base64-encoded, the
/// private half is persisted hex-encoded.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        self.signing.verifying_key().verify(message, &sig).is_ok()
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.signing.verifying_key().as_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// Hex of the 64-byte expanded key (seed followed by public key).
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing.to_keypair_bytes())
    }

    pub fn from_private_hex(hex_key: &str) -> Result<Self, EmsgError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| EmsgError::Validation(format!("private key hex: {e}")))?;
        let keypair: [u8; PRIVATE_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            EmsgError::Validation(format!(
                "private key length: expected {}, got {}",
                PRIVATE_KEY_LENGTH,
                b.len()
            ))
        })?;
        let signing = SigningKey::from_keypair_bytes(&keypair)
            .map_err(|_| EmsgError::Validation("private key bytes".to_string()))?;
        Ok(Self { signing })
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), EmsgError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            set_mode(parent, 0o700)?;
        }
        fs::write(path, self.private_key_hex())?;
        #[cfg(unix)]
        set_mode(path, 0o600)?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, EmsgError> {
        let contents = fs::read_to_string(path)?;
        Self::from_private_hex(&contents)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

pub fn public_key_from_base64(encoded: &str) -> Result<VerifyingKey, EmsgError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| EmsgError::Validation(format!("public key base64: {e}")))?;
    public_key_from_bytes(&bytes)
}

pub fn public_key_from_hex(encoded: &str) -> Result<VerifyingKey, EmsgError> {
    let bytes = hex::decode(encoded)
        .map_err(|e| EmsgError::Validation(format!("public key hex: {e}")))?;
    public_key_from_bytes(&bytes)
}

fn public_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, EmsgError> {
    let array: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
        EmsgError::Validation(format!(
            "public key length: expected {}, got {}",
            PUBLIC_KEY_LENGTH,
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&array)
        .map_err(|_| EmsgError::Validation("public key bytes".to_string()))
}

pub fn verify_detached(
    public_key: &VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> bool {
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    public_key.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"payload");
        assert_eq!(sig.len(), SIGNATURE_LENGTH);
        assert!(kp.verify(b"payload", &sig));
        assert!(!kp.verify(b"payloae", &sig));
    }

    #[test]
    fn hex_roundtrip_preserves_identity() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_private_hex(&kp.private_key_hex()).expect("load");
        assert_eq!(kp.public_key_base64(), restored.public_key_base64());
        let sig = restored.sign(b"msg");
        assert!(kp.verify(b"msg", &sig));
    }

    #[test]
    fn rejects_bad_encodings() {
        assert!(KeyPair::from_private_hex("zz").is_err());
        assert!(KeyPair::from_private_hex(&"ab".repeat(16)).is_err());
        assert!(public_key_from_base64("!!!").is_err());
        assert!(public_key_from_base64(&STANDARD.encode([0u8; 16])).is_err());
        assert!(public_key_from_hex(&"ff".repeat(31)).is_err());
    }

    #[test]
    fn key_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys").join("id.key");
        let kp = KeyPair::generate();
        kp.save_to_file(&path).expect("save");
        let loaded = KeyPair::load_from_file(&path).expect("load");
        assert_eq!(kp.public_key_hex(), loaded.public_key_hex());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
