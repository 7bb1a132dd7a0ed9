use super::{fixed_message, signed_message};
use crate::crypto::{EncryptionKeyPair, EncryptionManager, MemoryKeyStore};
use crate::error::EmsgError;
use crate::keys::KeyPair;
use crate::message::{derive_message_id, Message, MessageBuilder, SystemMessageBuilder};
use serde_json::json;
use std::sync::Arc;

#[test]
fn sign_verify_roundtrip() {
    let kp = KeyPair::generate();
    let message = signed_message(&kp);
    message.verify(&kp.public_key_base64()).expect("verify");
}

#[test]
fn tampered_body_fails_verification() {
    let kp = KeyPair::generate();
    let mut message = signed_message(&kp);
    message.body = "hj".to_string();
    assert!(matches!(
        message.verify(&kp.public_key_base64()),
        Err(EmsgError::SignatureInvalid)
    ));
}

#[test]
fn wrong_key_fails_verification() {
    let kp = KeyPair::generate();
    let other = KeyPair::generate();
    let message = signed_message(&kp);
    assert!(matches!(
        message.verify(&other.public_key_base64()),
        Err(EmsgError::SignatureInvalid)
    ));
}

#[test]
fn unsigned_message_cannot_verify() {
    let kp = KeyPair::generate();
    let message = fixed_message();
    assert!(message.verify(&kp.public_key_base64()).is_err());
    assert!(!message.is_signed());
}

#[test]
fn json_roundtrip() {
    let kp = KeyPair::generate();
    let message = signed_message(&kp);
    let encoded = message.to_json().expect("serialize");
    let decoded = Message::from_json(&encoded).expect("deserialize");
    assert_eq!(decoded, message);
    decoded.verify(&kp.public_key_base64()).expect("verify");
}

#[test]
fn signing_payload_omits_signature() {
    let kp = KeyPair::generate();
    let message = signed_message(&kp);
    let payload = message.signing_payload().expect("payload");
    let value: serde_json::Value = serde_json::from_slice(&payload).expect("json");
    assert!(value.get("signature").is_none());
    assert_eq!(value["from"], "alice#example.com");
}

#[test]
fn message_id_is_content_derived() {
    let message = fixed_message();
    let expected = derive_message_id(
        "alice#example.com",
        &["bob#test.org".to_string()],
        "hi",
        1_700_000_000,
    );
    assert_eq!(message.message_id, expected);
    assert_eq!(message.message_id.len(), 24);

    let other = derive_message_id(
        "alice#example.com",
        &["bob#test.org".to_string()],
        "hello",
        1_700_000_000,
    );
    assert_ne!(message.message_id, other);
}

#[test]
fn builder_respects_explicit_message_id() {
    let message = MessageBuilder::new()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .body("hi")
        .message_id("custom-id")
        .build()
        .expect("build");
    assert_eq!(message.message_id, "custom-id");
}

#[test]
fn validation_rejects_bad_messages() {
    let no_recipients = MessageBuilder::new()
        .from("alice#example.com")
        .body("hi")
        .build();
    assert!(no_recipients.is_err());

    let bad_address = MessageBuilder::new()
        .from("alice#example.com")
        .to(["not-an-address"])
        .body("hi")
        .build();
    assert!(bad_address.is_err());

    let empty_body = MessageBuilder::new()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .build();
    assert!(empty_body.is_err());

    let bad_cc = MessageBuilder::new()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .cc(["nope"])
        .body("hi")
        .build();
    assert!(bad_cc.is_err());

    let mut zero_timestamp = fixed_message();
    zero_timestamp.timestamp = 0;
    assert!(zero_timestamp.validate().is_err());
}

#[test]
fn system_message_type_must_match_body() {
    let message = SystemMessageBuilder::new()
        .kind("system:joined")
        .actor("alice#example.com")
        .group_id("team#example.com")
        .metadata("seat", json!(3))
        .build("system#example.com", vec!["team#example.com".to_string()])
        .expect("build");
    message.validate().expect("valid");
    assert!(message.is_system());
    let system = message.system_message().expect("body");
    assert_eq!(system.kind, "system:joined");
    assert_eq!(system.metadata["seat"], json!(3));

    let mut mismatched = message.clone();
    mismatched.kind = "system:left".to_string();
    assert!(mismatched.validate().is_err());

    let mut garbage_body = message;
    garbage_body.body = "not json".to_string();
    assert!(garbage_body.validate().is_err());
}

#[test]
fn recipients_concatenates_to_and_cc() {
    let message = MessageBuilder::new()
        .from("alice#example.com")
        .to(["bob#test.org", "carol#test.org"])
        .cc(["dave#example.com"])
        .body("hi")
        .build()
        .expect("build");
    assert_eq!(
        message.recipients(),
        vec!["bob#test.org", "carol#test.org", "dave#example.com"]
    );
}

fn manager_with_keys(pairs: &[(&str, &EncryptionKeyPair)]) -> Arc<EncryptionManager> {
    let store = Arc::new(MemoryKeyStore::new());
    let manager = Arc::new(EncryptionManager::new(EncryptionKeyPair::generate(), store));
    for (address, pair) in pairs {
        manager
            .register_public_key(address, &pair.public_key_base64())
            .expect("register");
    }
    manager
}

#[test]
fn builder_encrypts_when_every_recipient_has_a_key() {
    let bob = EncryptionKeyPair::generate();
    let carol = EncryptionKeyPair::generate();
    let manager = manager_with_keys(&[("bob#test.org", &bob), ("carol#test.org", &carol)]);

    let message = MessageBuilder::new()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .cc(["carol#test.org"])
        .body("secret plan")
        .with_encryption(manager.clone())
        .build()
        .expect("build");

    assert!(message.is_encrypted());
    assert_eq!(message.encryption_key, manager.public_key_base64());
    let envelope = message.envelope().expect("envelope");
    assert_eq!(bob.decrypt(&envelope).expect("bob"), b"secret plan");
    assert_eq!(carol.decrypt(&envelope).expect("carol"), b"secret plan");
}

#[test]
fn builder_falls_back_to_plaintext_when_a_key_is_missing() {
    let bob = EncryptionKeyPair::generate();
    let manager = manager_with_keys(&[("bob#test.org", &bob)]);

    let message = MessageBuilder::new()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .cc(["carol#test.org"])
        .body("secret plan")
        .with_encryption(manager)
        .build()
        .expect("build");

    assert!(!message.is_encrypted());
    assert_eq!(message.body, "secret plan");
    assert!(message.encryption_key.is_empty());
}

#[test]
fn encrypted_message_signs_over_ciphertext() {
    let kp = KeyPair::generate();
    let bob = EncryptionKeyPair::generate();
    let manager = manager_with_keys(&[("bob#test.org", &bob)]);

    let mut message = MessageBuilder::new()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .body("secret")
        .with_encryption(manager)
        .build()
        .expect("build");
    message.sign(&kp).expect("sign");
    message.verify(&kp.public_key_base64()).expect("verify");

    let envelope = message.envelope().expect("envelope");
    assert_eq!(bob.decrypt(&envelope).expect("decrypt"), b"secret");
}
