pub mod client_tests;
pub mod delivery_tests;
pub mod message_tests;

use crate::keys::KeyPair;
use crate::message::{Message, MessageBuilder};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fixed_message() -> Message {
    MessageBuilder::new()
        .from("alice#example.com")
        .to(["bob#test.org"])
        .body("hi")
        .timestamp(1_700_000_000)
        .build()
        .expect("build")
}

pub fn signed_message(key_pair: &KeyPair) -> Message {
    let mut message = fixed_message();
    message.sign(key_pair).expect("sign");
    message
}
