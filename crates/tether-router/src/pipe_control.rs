use tether_proto::control::{self, PipeControlInput};
use tether_proto::{DisconnectReason, InterfaceId, Message, ValidationError};

use crate::connector::Connector;

/// Receives decoded pipe-control notifications.
pub trait PipeControlMessageDelegate {
    /// Returns false if the notification violates the protocol.
    fn on_peer_associated_endpoint_closed(
        &self,
        id: InterfaceId,
        reason: Option<DisconnectReason>,
    ) -> bool;
}

pub(crate) struct PipeControlMessageHandler<'a, D: PipeControlMessageDelegate + ?Sized> {
    delegate: &'a D,
}

impl<'a, D: PipeControlMessageDelegate + ?Sized> PipeControlMessageHandler<'a, D> {
    pub(crate) fn new(delegate: &'a D) -> Self {
        Self { delegate }
    }

    pub(crate) fn accept(&self, message: &Message) -> Result<bool, ValidationError> {
        match control::decode_pipe_control(message)? {
            PipeControlInput::PeerAssociatedEndpointClosed { id, reason } => {
                Ok(self.delegate.on_peer_associated_endpoint_closed(id, reason))
            }
        }
    }
}

pub(crate) struct PipeControlMessageProxy<'a> {
    connector: &'a dyn Connector,
}

impl<'a> PipeControlMessageProxy<'a> {
    pub(crate) fn new(connector: &'a dyn Connector) -> Self {
        Self { connector }
    }

    pub(crate) fn notify_peer_endpoint_closed(
        &self,
        id: InterfaceId,
        reason: Option<DisconnectReason>,
    ) -> bool {
        self.connector
            .accept(control::peer_endpoint_closed_message(id, reason))
    }
}
