use proptest::prelude::*;
use tether_proto::message::MESSAGE_V1_HEADER_SIZE;
use tether_proto::{validate_message_header, Message, MessageHeader, MessageValidator};

const MAX_FUZZ_INPUT_LEN: usize = 4 * 1024;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn validate_message_header_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..MAX_FUZZ_INPUT_LEN)) {
        let _ = validate_message_header(&bytes);
    }

    #[test]
    fn encoded_headers_validate(
        interface_id in any::<u32>(),
        name in any::<u32>(),
        request_id in any::<u64>(),
        kind in 0u8..3,
        payload in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let header = match kind {
            0 => MessageHeader::new(name),
            1 => MessageHeader::request(name),
            _ => MessageHeader::response(name, request_id),
        }
        .with_interface_id(interface_id);
        let message = Message::new(header, &payload);
        let decoded = MessageValidator::default().validate(&message).unwrap();
        prop_assert_eq!(decoded.interface_id, interface_id);
        prop_assert_eq!(decoded.name, name);
        prop_assert_eq!(decoded.flags, header.flags);
        if kind == 2 {
            prop_assert_eq!(decoded.request_id, request_id);
        }
        prop_assert_eq!(message.payload().unwrap(), &payload[..]);
    }

    /// Flipping any bit in the first eight header bytes (size and version) must be rejected.
    #[test]
    fn size_or_version_bit_flips_are_rejected(bit in 0usize..64) {
        let mut message = Message::new(MessageHeader::request(3), b"payload").into_bytes();
        assert_eq!(validate_message_header(&message).map(|h| h.name), Ok(3));
        message[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(validate_message_header(&message).is_err());
    }
}

#[test]
fn v1_request_header_is_thirty_two_bytes() {
    let message = Message::new(MessageHeader::request(1), &[]);
    assert_eq!(message.len(), MESSAGE_V1_HEADER_SIZE);
}
