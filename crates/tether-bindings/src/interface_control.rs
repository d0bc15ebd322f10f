//! Version negotiation carried on an interface's own endpoint.

use tether_proto::control::{
    decode_run_input, decode_run_or_close_pipe_input, decode_run_response, run_message,
    run_or_close_pipe_message, run_response_message, RunInput, RunOrClosePipeInput, RunOutput,
    RunResponse, RUN_MESSAGE_ID, RUN_OR_CLOSE_PIPE_MESSAGE_ID,
};
use tether_proto::{Message, MessageHeader, ValidationError};

use crate::endpoint_client::{InterfaceEndpointClient, ResponseFuture};

/// Answers control requests on the implementing side.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ControlMessageHandler {
    interface_version: u32,
}

impl ControlMessageHandler {
    pub(crate) fn new(interface_version: u32) -> Self {
        Self { interface_version }
    }

    /// False means the message is invalid, or a required version is not implemented; either way
    /// the pipe is closed.
    pub(crate) fn accept(
        &self,
        client: &InterfaceEndpointClient,
        message: &Message,
        header: &MessageHeader,
    ) -> bool {
        match header.name {
            RUN_MESSAGE_ID => self.run(client, message, header),
            RUN_OR_CLOSE_PIPE_MESSAGE_ID => self.run_or_close_pipe(client, message, header),
            _ => false,
        }
    }

    fn run(
        &self,
        client: &InterfaceEndpointClient,
        message: &Message,
        header: &MessageHeader,
    ) -> bool {
        if !header.expects_response() {
            client.report_validation_error(&ValidationError::UnexpectedFlags {
                interface: client.interface_name(),
                name: header.name,
                problem: "run request without a response flag",
            });
            return false;
        }
        let input = match decode_run_input(message) {
            Ok(input) => input,
            Err(error) => {
                client.report_validation_error(&error);
                return false;
            }
        };
        let output = match input {
            RunInput::QueryVersion => Some(RunOutput::QueryVersionResult {
                version: self.interface_version,
            }),
            RunInput::FlushForTesting => None,
        };
        client.send_message(run_response_message(header.request_id, output));
        true
    }

    fn run_or_close_pipe(
        &self,
        client: &InterfaceEndpointClient,
        message: &Message,
        header: &MessageHeader,
    ) -> bool {
        if header.expects_response() {
            client.report_validation_error(&ValidationError::UnexpectedFlags {
                interface: client.interface_name(),
                name: header.name,
                problem: "run-or-close-pipe must be one-way",
            });
            return false;
        }
        match decode_run_or_close_pipe_input(message) {
            Ok(RunOrClosePipeInput::RequireVersion { version }) => {
                if version > self.interface_version {
                    tracing::warn!(
                        target: "tether.bindings",
                        interface = client.interface_name(),
                        required = version,
                        implemented = self.interface_version,
                        "peer requires an unimplemented version; closing pipe"
                    );
                    return false;
                }
                true
            }
            Err(error) => {
                client.report_validation_error(&error);
                false
            }
        }
    }
}

/// Sends control requests on the calling side.
pub(crate) struct ControlMessageProxy<'a> {
    client: &'a InterfaceEndpointClient,
}

impl<'a> ControlMessageProxy<'a> {
    pub(crate) fn new(client: &'a InterfaceEndpointClient) -> Self {
        Self { client }
    }

    /// `on_version` runs when the response is dispatched; it is dropped if the connection fails
    /// first.
    pub(crate) fn query_version(&self, on_version: impl FnOnce(u32) + 'static) -> bool {
        self.client
            .accept_with_responder(run_message(RunInput::QueryVersion), move |response| {
                match decode_run_response(response) {
                    Ok(RunResponse {
                        output: Some(RunOutput::QueryVersionResult { version }),
                    }) => {
                        on_version(version);
                        true
                    }
                    Ok(_) => false,
                    Err(error) => {
                        tracing::debug!(target: "tether.bindings", %error, "malformed run response");
                        false
                    }
                }
            })
    }

    pub(crate) fn require_version(&self, version: u32) -> bool {
        self.client
            .accept(run_or_close_pipe_message(RunOrClosePipeInput::RequireVersion { version }))
    }

    pub(crate) fn flush_for_testing(&self) -> ResponseFuture {
        self.client
            .accept_with_response(run_message(RunInput::FlushForTesting))
    }
}
