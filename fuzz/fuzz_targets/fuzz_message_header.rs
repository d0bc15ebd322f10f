#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_proto::{validate_message_header, Message, MessageValidator};

mod utils;

fuzz_target!(|data: &[u8]| {
    let data = &data[..data.len().min(utils::MAX_INPUT_SIZE)];

    let Ok(header) = validate_message_header(data) else {
        return;
    };
    assert!(header.encoded_len() <= data.len());

    let message = Message::from_bytes(data.to_vec());
    let validated = MessageValidator::default()
        .validate(&message)
        .expect("a valid header stays valid inside a message");
    assert_eq!(validated, header);
    assert_eq!(message.interface_id(), Some(header.interface_id));
});
