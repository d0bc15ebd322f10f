//! Control messages multiplexed over the same pipe as interface traffic.

use serde::{Deserialize, Serialize};

use crate::codec::{decode_payload, encode_payload};
use crate::message::{Message, MessageHeader};
use crate::validation::ValidationError;
use crate::{
    is_valid_interface_id, DisconnectReason, InterfaceId, INVALID_INTERFACE_ID,
};

/// Interface control request that expects a response.
pub const RUN_MESSAGE_ID: u32 = 0xFFFF_FFFF;
/// One-way control message; on the pipe-control id it is a pipe notification, on an interface
/// id a failed check closes the pipe.
pub const RUN_OR_CLOSE_PIPE_MESSAGE_ID: u32 = 0xFFFF_FFFE;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PipeControlInput {
    PeerAssociatedEndpointClosed {
        id: InterfaceId,
        reason: Option<DisconnectReason>,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunInput {
    QueryVersion,
    FlushForTesting,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunOutput {
    QueryVersionResult { version: u32 },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResponse {
    pub output: Option<RunOutput>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunOrClosePipeInput {
    RequireVersion { version: u32 },
}

pub fn is_pipe_control_message(header: &MessageHeader) -> bool {
    header.interface_id == INVALID_INTERFACE_ID && header.name == RUN_OR_CLOSE_PIPE_MESSAGE_ID
}

pub fn is_interface_control_message(header: &MessageHeader) -> bool {
    is_valid_interface_id(header.interface_id)
        && (header.name == RUN_MESSAGE_ID || header.name == RUN_OR_CLOSE_PIPE_MESSAGE_ID)
}

fn control_message<T: Serialize>(header: MessageHeader, value: &T) -> Message {
    // Control payloads are small enums of integers and strings; bincode cannot fail on them
    // below the size limit.
    let payload = encode_payload(value).expect("control payloads always encode");
    Message::new(header, &payload)
}

pub fn peer_endpoint_closed_message(id: InterfaceId, reason: Option<DisconnectReason>) -> Message {
    control_message(
        MessageHeader::new(RUN_OR_CLOSE_PIPE_MESSAGE_ID).with_interface_id(INVALID_INTERFACE_ID),
        &PipeControlInput::PeerAssociatedEndpointClosed { id, reason },
    )
}

pub fn decode_pipe_control(message: &Message) -> Result<PipeControlInput, ValidationError> {
    Ok(decode_payload(message.payload()?)?)
}

/// A `Run` request addressed to the master endpoint; the caller re-addresses it and assigns the
/// request id.
pub fn run_message(input: RunInput) -> Message {
    control_message(MessageHeader::request(RUN_MESSAGE_ID), &input)
}

pub fn run_response_message(request_id: u64, output: Option<RunOutput>) -> Message {
    control_message(
        MessageHeader::response(RUN_MESSAGE_ID, request_id),
        &RunResponse { output },
    )
}

pub fn run_or_close_pipe_message(input: RunOrClosePipeInput) -> Message {
    control_message(MessageHeader::new(RUN_OR_CLOSE_PIPE_MESSAGE_ID), &input)
}

pub fn decode_run_input(message: &Message) -> Result<RunInput, ValidationError> {
    Ok(decode_payload(message.payload()?)?)
}

pub fn decode_run_response(message: &Message) -> Result<RunResponse, ValidationError> {
    Ok(decode_payload(message.payload()?)?)
}

pub fn decode_run_or_close_pipe_input(
    message: &Message,
) -> Result<RunOrClosePipeInput, ValidationError> {
    Ok(decode_payload(message.payload()?)?)
}
