use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use tether_proto::control::is_interface_control_message;
use tether_proto::{
    DisconnectReason, InterfaceId, Message, MessageHeader, MessageValidator, ValidationError,
};
use tether_router::{EndpointClient, EndpointHandle, Router, WeakRouter};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::interface::MessageReceiver;
use crate::interface_control::ControlMessageHandler;

pub type ConnectionErrorHandler = Rc<dyn Fn(Option<DisconnectReason>)>;

type ResponseCallback = Box<dyn FnOnce(&Message) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    #[error("the connection closed before a response arrived")]
    Disconnected,
}

/// Resolves with the response to a request sent through
/// [`InterfaceEndpointClient::accept_with_response`].
///
/// Fails with [`ResponseError::Disconnected`] if the endpoint errors or closes first.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Message>,
}

impl ResponseFuture {
    /// Non-blocking check for a response that has already been dispatched.
    pub fn try_take(&mut self) -> Option<Result<Message, ResponseError>> {
        match self.rx.try_recv() {
            Ok(message) => Some(Ok(message)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(ResponseError::Disconnected)),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Message, ResponseError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ResponseError::Disconnected))
    }
}

/// Sends the response to one request. Dropping it without responding leaves the caller's
/// request pending until the connection goes away.
pub struct Responder {
    client: Weak<InterfaceEndpointClient>,
    request_id: u64,
}

impl Responder {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn respond(self, name: u32, payload: &[u8]) -> bool {
        let message = Message::new(MessageHeader::response(name, self.request_id), payload);
        self.send(message)
    }

    pub(crate) fn send(self, message: Message) -> bool {
        match self.client.upgrade() {
            Some(client) => client.send_message(message),
            None => false,
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// The [`EndpointClient`] behind every proxy and stub.
///
/// Without a receiver it acts as a proxy's error sink and response correlator; with one it
/// dispatches requests to a stub and answers interface control requests.
pub struct InterfaceEndpointClient {
    weak_self: Weak<InterfaceEndpointClient>,
    interface_name: &'static str,
    id: InterfaceId,
    router: WeakRouter,
    handle: RefCell<Option<EndpointHandle>>,
    receiver: Option<Box<dyn MessageReceiver>>,
    control_handler: Option<ControlMessageHandler>,
    validator: MessageValidator,
    next_request_id: Cell<u64>,
    responders: RefCell<HashMap<u64, ResponseCallback>>,
    error_handler: RefCell<Option<ConnectionErrorHandler>>,
    encountered_error: Cell<bool>,
    closed: Cell<bool>,
}

impl InterfaceEndpointClient {
    /// Creates the client and attaches it to the router behind `handle`.
    pub fn new(
        handle: EndpointHandle,
        receiver: Option<Box<dyn MessageReceiver>>,
        validator: MessageValidator,
        interface_name: &'static str,
        interface_version: u32,
    ) -> Rc<Self> {
        let id = handle.id();
        let router = handle.router();
        let control_handler = receiver
            .as_ref()
            .map(|_| ControlMessageHandler::new(interface_version));
        let client = Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            interface_name,
            id,
            router: router
                .as_ref()
                .map(Router::downgrade)
                .unwrap_or_default(),
            handle: RefCell::new(None),
            receiver,
            control_handler,
            validator,
            next_request_id: Cell::new(1),
            responders: RefCell::new(HashMap::new()),
            error_handler: RefCell::new(None),
            encountered_error: Cell::new(false),
            closed: Cell::new(false),
        });
        if let Some(router) = &router {
            router.attach_endpoint_client(&handle, client.clone());
        }
        *client.handle.borrow_mut() = Some(handle);
        tracing::trace!(
            target: "tether.bindings",
            interface = interface_name,
            id,
            "endpoint client attached"
        );
        client
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.id
    }

    pub fn interface_name(&self) -> &'static str {
        self.interface_name
    }

    pub fn router(&self) -> Option<Router> {
        self.router.upgrade()
    }

    pub fn is_bound(&self) -> bool {
        self.handle.borrow().is_some()
    }

    pub fn encountered_error(&self) -> bool {
        self.encountered_error.get()
    }

    pub fn set_connection_error_handler(&self, handler: ConnectionErrorHandler) {
        let previous = self.error_handler.borrow_mut().replace(handler);
        drop(previous);
    }

    /// Sends a one-way message on this endpoint.
    pub fn accept(&self, message: Message) -> bool {
        debug_assert!(
            !message.header().is_ok_and(|header| header.expects_response()),
            "requests must go through accept_with_response"
        );
        self.send_message(message)
    }

    /// Sends a request; `on_response` runs when the matching response is dispatched and returns
    /// false if the response is unacceptable.
    ///
    /// Returns false, dropping `on_response`, if the request could not be sent.
    pub fn accept_with_responder(
        &self,
        mut message: Message,
        on_response: impl FnOnce(&Message) -> bool + 'static,
    ) -> bool {
        if self.encountered_error.get() || !self.is_bound() {
            return false;
        }
        let request_id = self.next_request_id.get();
        self.next_request_id.set(request_id.wrapping_add(1));
        message.set_request_id(request_id);

        self.responders
            .borrow_mut()
            .insert(request_id, Box::new(on_response));
        if !self.send_message(message) {
            let callback = self.responders.borrow_mut().remove(&request_id);
            drop(callback);
            return false;
        }
        true
    }

    pub fn accept_with_response(&self, message: Message) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        self.accept_with_responder(message, move |response| {
            let _ = tx.send(response.clone());
            true
        });
        ResponseFuture { rx }
    }

    pub(crate) fn send_message(&self, mut message: Message) -> bool {
        if !self.is_bound() {
            return false;
        }
        let Some(router) = self.router.upgrade() else {
            return false;
        };
        message.set_interface_id(self.id);
        router.send_message(message)
    }

    pub(crate) fn report_validation_error(&self, error: &ValidationError) {
        match self.router.upgrade() {
            Some(router) => router.report_validation_error(error),
            None => tracing::warn!(
                target: "tether.bindings",
                interface = self.interface_name,
                %error,
                "invalid message"
            ),
        }
    }

    pub fn pending_responses(&self) -> usize {
        self.responders.borrow().len()
    }

    /// Detaches from the router and closes the endpoint. Outstanding responses fail and later
    /// error notifications are ignored. Idempotent.
    pub fn close(&self, reason: Option<DisconnectReason>) {
        let Some(handle) = self.handle.borrow_mut().take() else {
            return;
        };
        self.closed.set(true);
        if let Some(router) = handle.router() {
            router.detach_endpoint_client(&handle);
        }
        match reason {
            Some(reason) => handle.close_with_reason(reason),
            None => handle.close(),
        }

        let responders = std::mem::take(&mut *self.responders.borrow_mut());
        drop(responders);
        let handler = self.error_handler.borrow_mut().take();
        drop(handler);
    }

    fn handle_response(&self, message: &Message, header: &MessageHeader) -> bool {
        let callback = self.responders.borrow_mut().remove(&header.request_id);
        let Some(callback) = callback else {
            self.report_validation_error(&ValidationError::UnexpectedResponse {
                request_id: header.request_id,
            });
            return false;
        };
        if !is_interface_control_message(header) {
            if let Err(error) = self.validator.validate_payload(message, header) {
                self.report_validation_error(&error);
                return false;
            }
        }
        callback(message)
    }

    fn unknown_method(&self, header: &MessageHeader) -> bool {
        self.report_validation_error(&ValidationError::UnknownMethod {
            interface: self.interface_name,
            name: header.name,
        });
        false
    }
}

impl EndpointClient for InterfaceEndpointClient {
    fn handle_incoming_message(&self, message: &Message) -> bool {
        let header = match message.header() {
            Ok(header) => header,
            Err(error) => {
                self.report_validation_error(&error);
                return false;
            }
        };

        if header.is_response() {
            return self.handle_response(message, &header);
        }
        if is_interface_control_message(&header) {
            return match &self.control_handler {
                Some(handler) => handler.accept(self, message, &header),
                None => self.unknown_method(&header),
            };
        }
        let Some(receiver) = &self.receiver else {
            return self.unknown_method(&header);
        };
        if let Err(error) = self.validator.validate_payload(message, &header) {
            self.report_validation_error(&error);
            return false;
        }
        if header.expects_response() {
            let responder = Responder {
                client: self.weak_self.clone(),
                request_id: header.request_id,
            };
            receiver.accept_with_responder(message, responder)
        } else {
            receiver.accept(message)
        }
    }

    fn notify_error(&self, reason: Option<DisconnectReason>) {
        if self.closed.get() || self.encountered_error.replace(true) {
            return;
        }
        tracing::debug!(
            target: "tether.bindings",
            interface = self.interface_name,
            id = self.id,
            ?reason,
            "connection error"
        );
        let responders = std::mem::take(&mut *self.responders.borrow_mut());
        drop(responders);
        let handler = self.error_handler.borrow().clone();
        if let Some(handler) = handler {
            handler(reason);
        }
    }
}

impl fmt::Debug for InterfaceEndpointClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceEndpointClient")
            .field("interface", &self.interface_name)
            .field("id", &self.id)
            .field("bound", &self.is_bound())
            .field("encountered_error", &self.encountered_error())
            .finish()
    }
}
