//! Wire-level types shared by both ends of a tether pipe.
//!
//! A pipe carries framed [`Message`]s. Every message starts with a small fixed-layout header
//! naming the interface endpoint it belongs to; the rest of the buffer is an opaque payload owned
//! by whatever interface code sits on top of that endpoint. Two families of control messages
//! share the same channel:
//!
//! - pipe control (`INVALID_INTERFACE_ID` + [`control::RUN_OR_CLOSE_PIPE_MESSAGE_ID`]) announces
//!   that the peer closed one of its endpoints;
//! - interface control travels on an endpoint's own id and carries version negotiation.

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod control;
pub mod ids;
pub mod message;
pub mod validation;

pub use codec::CodecError;
pub use ids::{
    has_namespace_bit, is_master_interface_id, is_valid_interface_id, InterfaceId,
    InterfaceIdAllocator, InterfaceIdNamespace, INTERFACE_ID_NAMESPACE_MASK,
    INVALID_INTERFACE_ID, MASTER_INTERFACE_ID,
};
pub use message::{Message, MessageHeader};
pub use validation::{validate_message_header, MessageValidator, PayloadValidator, ValidationError};

/// Hard upper bound on the size of a single message, header included.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Why an endpoint (or a whole pipe) was closed, as reported to the peer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectReason {
    pub custom_reason: u32,
    pub description: String,
}

impl DisconnectReason {
    pub fn new(custom_reason: u32, description: impl Into<String>) -> Self {
        Self {
            custom_reason,
            description: description.into(),
        }
    }
}
