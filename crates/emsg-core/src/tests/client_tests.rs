use crate::config::{ClientConfig, ResolverConfig, RetryStrategy};
use crate::crypto::{EncryptionKeyPair, MemoryKeyStore};
use crate::delivery::DeliveryStatus;
use crate::dns::{StaticTxtLookup, TxtLookup};
use crate::error::EmsgError;
use crate::keys::KeyPair;
use crate::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> ClientConfig {
    ClientConfig {
        timeout: Duration::from_secs(2),
        resolver: ResolverConfig {
            timeout: Duration::from_secs(1),
            retries: 1,
        },
        retry: RetryStrategy {
            max_retries: 0,
            initial_delay: Duration::from_millis(10),
            ..RetryStrategy::default()
        },
        enable_delivery_tracking: true,
        ..ClientConfig::default()
    }
}

fn unreachable_lookup() -> Arc<dyn TxtLookup> {
    // Port 1 refuses connections, so sends fail fast after discovery.
    Arc::new(
        StaticTxtLookup::new()
            .with_record("_emsg.example.com", "http://127.0.0.1:1")
            .with_record("_emsg.test.org", "http://127.0.0.1:1"),
    )
}

fn client() -> Client {
    Client::with_lookup(fast_config(), KeyPair::generate(), unreachable_lookup())
        .expect("client")
}

#[tokio::test]
async fn resolve_goes_through_injected_lookup() {
    let client = client();
    let info = client.resolve_domain("example.com").await.expect("resolve");
    assert_eq!(info.url, "http://127.0.0.1:1");
    assert!(matches!(
        client.resolve_domain("unknown.example").await,
        Err(EmsgError::Discovery(_))
    ));
}

#[tokio::test]
async fn failed_send_leaves_receipt_failed_with_cause() {
    let client = client();
    let message = client
        .compose_message()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .body("hi")
        .build()
        .expect("build");
    let id = message.message_id.clone();

    let err = client.send(message).await.unwrap_err();
    assert!(err.to_string().contains("test.org"));

    let receipt = client.delivery_receipt(&id).expect("receipt");
    assert_eq!(receipt.status, DeliveryStatus::Failed);
    assert!(receipt.error_message.contains("test.org"));
    assert_eq!(
        client.delivery_stats().get(&DeliveryStatus::Failed),
        Some(&1)
    );
}

#[tokio::test]
async fn before_send_hook_can_abort() {
    let mut client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        client.set_before_send(Arc::new(move |_message| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EmsgError::Validation("blocked by policy".to_string()))
        }));
    }

    let message = client
        .compose_message()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .body("hi")
        .build()
        .expect("build");
    let id = message.message_id.clone();

    let err = client.send(message).await.unwrap_err();
    assert!(err.to_string().contains("before send hook"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let receipt = client.delivery_receipt(&id).expect("receipt");
    assert_eq!(receipt.status, DeliveryStatus::Failed);
    assert!(receipt.error_message.contains("blocked by policy"));
}

#[tokio::test]
async fn invalid_message_is_rejected_before_any_request() {
    let client = client();
    let mut message = client
        .compose_message()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .body("hi")
        .build()
        .expect("build");
    message.to.clear();
    assert!(matches!(
        client.send(message).await,
        Err(EmsgError::Validation(_))
    ));
}

#[tokio::test]
async fn register_user_validates_the_address_first() {
    let client = client();
    assert!(matches!(
        client.register_user("not-an-address").await,
        Err(EmsgError::Address(_))
    ));
    // Valid address reaches the (unreachable) server.
    assert!(matches!(
        client.register_user("alice#example.com").await,
        Err(EmsgError::Transport(_))
    ));
}

#[tokio::test]
async fn encryption_toggles_and_decrypts_end_to_end() {
    let alice = client();
    let bob = client();
    assert!(!alice.is_encryption_enabled());
    assert!(alice.register_public_key("x#example.com", "AAAA").is_err());

    let alice_pair = EncryptionKeyPair::generate();
    let bob_pair = EncryptionKeyPair::generate();
    alice.enable_encryption(alice_pair, Arc::new(MemoryKeyStore::new()));
    bob.enable_encryption(bob_pair.clone(), Arc::new(MemoryKeyStore::new()));
    assert!(alice.is_encryption_enabled());

    alice
        .register_public_key("bob#test.org", &bob_pair.public_key_base64())
        .expect("register");
    assert!(alice.can_encrypt_for("bob#test.org"));
    assert!(!alice.can_encrypt_for("carol#test.org"));

    let message = alice
        .compose_message()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .body("the plan")
        .build()
        .expect("build");
    assert!(message.is_encrypted());

    let plaintext = bob.decrypt_message(&message).expect("decrypt");
    assert_eq!(plaintext, "the plan");

    alice.disable_encryption();
    assert!(!alice.is_encryption_enabled());
}

#[tokio::test]
async fn feature_gates_report_disabled_state() {
    let config = ClientConfig {
        enable_delivery_tracking: false,
        ..fast_config()
    };
    let client =
        Client::with_lookup(config, KeyPair::generate(), unreachable_lookup()).expect("client");

    assert!(!client.is_delivery_tracking_enabled());
    assert!(client.delivery_receipt("x").is_err());
    assert!(client.pending_retries().is_empty());
    assert_eq!(client.cleanup_expired_receipts(), 0);

    assert!(!client.is_notifications_enabled());
    assert!(client
        .register_notification_handler(
            crate::notify::NotificationEvent::MessageSent,
            Arc::new(|_| Ok(())),
        )
        .is_err());
    assert!(client.start_message_polling("alice#example.com").is_err());
    assert!(!client.is_message_polling_running());

    assert!(!client.is_stream_connected());
    assert!(client.disconnect_stream().is_err());
}

#[tokio::test]
async fn notifications_wire_through_the_facade() {
    let config = ClientConfig {
        enable_notifications: true,
        poll_interval: Duration::from_millis(50),
        ..fast_config()
    };
    let client =
        Client::with_lookup(config, KeyPair::generate(), unreachable_lookup()).expect("client");
    assert!(client.is_notifications_enabled());

    client
        .register_notification_handler(
            crate::notify::NotificationEvent::MessageSent,
            Arc::new(|_| Ok(())),
        )
        .expect("register");
    assert_eq!(
        client.notification_handler_count(crate::notify::NotificationEvent::MessageSent),
        1
    );

    client.start_message_polling("alice#example.com").expect("start");
    assert!(client.is_message_polling_running());
    assert!(client.start_message_polling("alice#example.com").is_err());
    client.stop_message_polling();
    assert!(!client.is_message_polling_running());

    client.shutdown_notifications();
}

#[tokio::test]
async fn attachment_passthroughs_share_the_manager() {
    let client = client();
    let attachment = client
        .create_attachment_from_data("note.txt", b"contents", "text/plain")
        .expect("create");
    client.validate_attachment(&attachment).expect("valid");
    assert_eq!(client.attachment_data(&attachment).expect("data"), b"contents");
    // No storage directory configured by default.
    assert!(client.save_attachment(&attachment).is_err());
}

#[tokio::test]
async fn groups_are_reachable_from_the_facade() {
    let client = client();
    client
        .groups()
        .create_group("team#example.com", "team", "alice#example.com", None)
        .await
        .expect("create");
    assert!(client
        .groups()
        .has_permission(
            "team#example.com",
            "alice#example.com",
            crate::groups::Permission::ManageGroup,
        )
        .await);
}
