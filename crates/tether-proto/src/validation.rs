use crate::message::{
    ByteReader, Message, MessageHeader, MESSAGE_FLAG_EXPECTS_RESPONSE,
    MESSAGE_FLAG_IS_RESPONSE, MESSAGE_KNOWN_FLAGS, MESSAGE_V0_HEADER_SIZE, MESSAGE_V1_HEADER_SIZE,
};
use crate::{InterfaceId, MAX_MESSAGE_BYTES};

/// Reasons an incoming message is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message too short: {len} bytes")]
    MessageTooShort { len: usize },

    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },

    #[error("unexpected message header: size {size}, version {version}")]
    UnexpectedHeader { size: u32, version: u32 },

    #[error("message header declares {size} bytes but the message is only {len} bytes")]
    HeaderExceedsMessage { size: u32, len: usize },

    #[error("invalid message header flags {flags:#x}")]
    InvalidFlags { flags: u32 },

    #[error("message header padding is {padding:#x}, expected zero")]
    NonZeroPadding { padding: u32 },

    #[error("message header is missing a request id")]
    MissingRequestId,

    #[error("interface id {id} is not valid on this pipe")]
    UnexpectedInterfaceId { id: InterfaceId },

    #[error("unknown method {name} on {interface}")]
    UnknownMethod { interface: &'static str, name: u32 },

    #[error("unexpected response to request {request_id}")]
    UnexpectedResponse { request_id: u64 },

    #[error("message {name} on {interface} {problem}")]
    UnexpectedFlags {
        interface: &'static str,
        name: u32,
        problem: &'static str,
    },

    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },

    #[error("too many messages queued for endpoint {id} (max {max})")]
    EndpointQueueFull { id: InterfaceId, max: usize },
}

/// Validates the fixed-layout header at the start of `bytes`.
pub fn validate_message_header(bytes: &[u8]) -> Result<MessageHeader, ValidationError> {
    let len = bytes.len();
    let mut r = ByteReader::new(bytes);
    let size = r.read_u32()?;
    let version = r.read_u32()?;

    if (size as usize) < MESSAGE_V0_HEADER_SIZE {
        return Err(ValidationError::UnexpectedHeader { size, version });
    }
    if size as usize > len {
        return Err(ValidationError::HeaderExceedsMessage { size, len });
    }
    match (version, size as usize) {
        (0, MESSAGE_V0_HEADER_SIZE) | (1, MESSAGE_V1_HEADER_SIZE) => {}
        _ => return Err(ValidationError::UnexpectedHeader { size, version }),
    }

    let interface_id = r.read_u32()?;
    let name = r.read_u32()?;
    let flags = r.read_u32()?;
    let padding = r.read_u32()?;

    if flags & !MESSAGE_KNOWN_FLAGS != 0 {
        return Err(ValidationError::InvalidFlags { flags });
    }
    let expects_response = flags & MESSAGE_FLAG_EXPECTS_RESPONSE != 0;
    let is_response = flags & MESSAGE_FLAG_IS_RESPONSE != 0;
    if expects_response && is_response {
        return Err(ValidationError::InvalidFlags { flags });
    }
    if version == 0 && (expects_response || is_response) {
        return Err(ValidationError::MissingRequestId);
    }

    if padding != 0 {
        return Err(ValidationError::NonZeroPadding { padding });
    }

    let request_id = if version == 1 { r.read_u64()? } else { 0 };

    Ok(MessageHeader {
        interface_id,
        name,
        flags,
        request_id,
    })
}

/// Per-interface payload checks, run after the header has been validated.
pub trait PayloadValidator {
    fn validate(&self, message: &Message, header: &MessageHeader) -> Result<(), ValidationError>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&Message, &MessageHeader) -> Result<(), ValidationError>,
{
    fn validate(&self, message: &Message, header: &MessageHeader) -> Result<(), ValidationError> {
        self(message, header)
    }
}

/// Header validation with a size cap, followed by any registered payload validators.
pub struct MessageValidator {
    max_message_len: usize,
    payload_validators: Vec<Box<dyn PayloadValidator>>,
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_BYTES)
    }
}

impl MessageValidator {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            max_message_len: max_message_len.min(MAX_MESSAGE_BYTES),
            payload_validators: Vec::new(),
        }
    }

    pub fn with_payload_validator(mut self, validator: impl PayloadValidator + 'static) -> Self {
        self.add_payload_validator(validator);
        self
    }

    pub fn add_payload_validator(&mut self, validator: impl PayloadValidator + 'static) {
        self.payload_validators.push(Box::new(validator));
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    pub fn validate_header(&self, message: &Message) -> Result<MessageHeader, ValidationError> {
        if message.len() > self.max_message_len {
            return Err(ValidationError::MessageTooLarge {
                len: message.len(),
                max: self.max_message_len,
            });
        }
        message.header()
    }

    pub fn validate_payload(
        &self,
        message: &Message,
        header: &MessageHeader,
    ) -> Result<(), ValidationError> {
        for validator in &self.payload_validators {
            validator.validate(message, header)?;
        }
        Ok(())
    }

    pub fn validate(&self, message: &Message) -> Result<MessageHeader, ValidationError> {
        let header = self.validate_header(message)?;
        self.validate_payload(message, &header)?;
        Ok(header)
    }
}
