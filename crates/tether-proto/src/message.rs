use std::fmt;

use crate::validation::{validate_message_header, ValidationError};
use crate::{InterfaceId, MASTER_INTERFACE_ID};

pub const MESSAGE_V0_HEADER_SIZE: usize = 24;
pub const MESSAGE_V1_HEADER_SIZE: usize = 32;

pub const MESSAGE_FLAG_EXPECTS_RESPONSE: u32 = 1 << 0;
pub const MESSAGE_FLAG_IS_RESPONSE: u32 = 1 << 1;
pub const MESSAGE_KNOWN_FLAGS: u32 = MESSAGE_FLAG_EXPECTS_RESPONSE | MESSAGE_FLAG_IS_RESPONSE;

pub(crate) const HEADER_SIZE_OFFSET: usize = 0;
pub(crate) const VERSION_OFFSET: usize = 4;
pub(crate) const INTERFACE_ID_OFFSET: usize = 8;
pub(crate) const NAME_OFFSET: usize = 12;
pub(crate) const REQUEST_ID_OFFSET: usize = 24;

/// Decoded form of the fixed-layout message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub interface_id: InterfaceId,
    pub name: u32,
    pub flags: u32,
    /// Only meaningful when [`MessageHeader::has_request_id`] is true.
    pub request_id: u64,
}

impl MessageHeader {
    /// A one-way message header addressed to the master endpoint.
    pub fn new(name: u32) -> Self {
        Self {
            interface_id: MASTER_INTERFACE_ID,
            name,
            flags: 0,
            request_id: 0,
        }
    }

    pub fn request(name: u32) -> Self {
        Self {
            flags: MESSAGE_FLAG_EXPECTS_RESPONSE,
            ..Self::new(name)
        }
    }

    pub fn response(name: u32, request_id: u64) -> Self {
        Self {
            flags: MESSAGE_FLAG_IS_RESPONSE,
            request_id,
            ..Self::new(name)
        }
    }

    pub fn with_interface_id(mut self, interface_id: InterfaceId) -> Self {
        self.interface_id = interface_id;
        self
    }

    pub fn expects_response(&self) -> bool {
        self.flags & MESSAGE_FLAG_EXPECTS_RESPONSE != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & MESSAGE_FLAG_IS_RESPONSE != 0
    }

    pub fn has_request_id(&self) -> bool {
        self.expects_response() || self.is_response()
    }

    pub fn version(&self) -> u32 {
        if self.has_request_id() {
            1
        } else {
            0
        }
    }

    pub fn encoded_len(&self) -> usize {
        if self.has_request_id() {
            MESSAGE_V1_HEADER_SIZE
        } else {
            MESSAGE_V0_HEADER_SIZE
        }
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.write_u32(self.encoded_len() as u32);
        w.write_u32(self.version());
        w.write_u32(self.interface_id);
        w.write_u32(self.name);
        w.write_u32(self.flags);
        w.write_u32(0); // padding
        if self.has_request_id() {
            w.write_u64(self.request_id);
        }
    }
}

/// One framed message: header followed by payload, in a single contiguous buffer.
///
/// A `Message` built with [`Message::new`] is always well formed. One built with
/// [`Message::from_bytes`] is whatever arrived off the wire and must be validated before its
/// header is trusted.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    data: Vec<u8>,
}

impl Message {
    pub fn new(header: MessageHeader, payload: &[u8]) -> Self {
        let mut w = ByteWriter::with_capacity(header.encoded_len() + payload.len());
        header.encode(&mut w);
        w.write_bytes(payload);
        Self { data: w.into_vec() }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Validates and decodes the header.
    pub fn header(&self) -> Result<MessageHeader, ValidationError> {
        validate_message_header(&self.data)
    }

    /// The bytes following a valid header.
    pub fn payload(&self) -> Result<&[u8], ValidationError> {
        let header = self.header()?;
        Ok(&self.data[header.encoded_len()..])
    }

    /// Raw interface id field, without validating the rest of the header.
    pub fn interface_id(&self) -> Option<InterfaceId> {
        ByteReader::at(&self.data, INTERFACE_ID_OFFSET)
            .read_u32()
            .ok()
    }

    /// Re-addresses the message to another endpoint.
    ///
    /// Panics if the buffer is too short to hold a header; only messages built locally are
    /// re-addressed.
    pub fn set_interface_id(&mut self, id: InterfaceId) {
        assert!(
            self.data.len() >= MESSAGE_V0_HEADER_SIZE,
            "message too short to carry an interface id"
        );
        self.data[INTERFACE_ID_OFFSET..INTERFACE_ID_OFFSET + 4].copy_from_slice(&id.to_le_bytes());
    }

    /// Panics unless the message carries a version 1 header.
    pub fn set_request_id(&mut self, request_id: u64) {
        let header_size = ByteReader::at(&self.data, HEADER_SIZE_OFFSET).read_u32().ok();
        assert_eq!(
            header_size,
            Some(MESSAGE_V1_HEADER_SIZE as u32),
            "only version 1 headers carry a request id"
        );
        self.data[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 8]
            .copy_from_slice(&request_id.to_le_bytes());
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        s.field("len", &self.data.len());
        match self.header() {
            Ok(header) => s.field("header", &header),
            Err(err) => s.field("invalid", &err),
        };
        s.finish()
    }
}

/// Little-endian writer for header fields.
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Little-endian reader over an untrusted buffer.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ValidationError> {
        let end = self
            .pos
            .checked_add(N)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ValidationError::MessageTooShort {
                len: self.buf.len(),
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, ValidationError> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, ValidationError> {
        self.take::<8>().map(u64::from_le_bytes)
    }
}
