use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tether_config::RouterConfig;
use tether_proto::control::is_pipe_control_message;
use tether_proto::{
    is_master_interface_id, is_valid_interface_id, DisconnectReason, InterfaceId,
    InterfaceIdAllocator, InterfaceIdNamespace, Message, MessageValidator, ValidationError,
};

use crate::connector::{Connector, PipeConnector};
use crate::endpoint::{EndpointClient, EndpointState, EndpointStateUpdate, EndpointTable};
use crate::pipe::PipeHandle;
use crate::pipe_control::{
    PipeControlMessageDelegate, PipeControlMessageHandler, PipeControlMessageProxy,
};
use crate::runner::TaskRunner;

pub type ValidationErrorHandler = Rc<dyn Fn(&ValidationError)>;

/// Demultiplexes one pipe into interface endpoints.
///
/// `Router` is a cheap, reference-counted handle. Endpoint handles and clients hold a
/// [`WeakRouter`] so the strong owners (the interface pointer or binding that created the router)
/// decide when it goes away.
#[derive(Clone)]
pub struct Router {
    inner: Rc<Inner>,
}

#[derive(Clone, Default)]
pub struct WeakRouter {
    inner: Weak<Inner>,
}

impl WeakRouter {
    pub fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

struct Inner {
    connector: Box<dyn Connector>,
    runner: TaskRunner,
    config: RouterConfig,
    validator: MessageValidator,
    endpoints: RefCell<EndpointTable>,
    ids: RefCell<InterfaceIdAllocator>,
    encountered_error: Cell<bool>,
    closed: Cell<bool>,
    testing_mode: Cell<bool>,
    validation_error_handler: RefCell<Option<ValidationErrorHandler>>,
}

impl Router {
    pub fn new(handle: PipeHandle, namespace: InterfaceIdNamespace, config: RouterConfig) -> Self {
        let runner = handle.runner().clone();
        Self::with_connector(
            Box::new(PipeConnector::new(handle)),
            runner,
            namespace,
            config,
        )
    }

    pub fn with_connector(
        connector: Box<dyn Connector>,
        runner: TaskRunner,
        namespace: InterfaceIdNamespace,
        config: RouterConfig,
    ) -> Self {
        let inner = Rc::new(Inner {
            validator: MessageValidator::new(config.effective_max_message_len()),
            testing_mode: Cell::new(config.testing_mode),
            connector,
            runner,
            config,
            endpoints: RefCell::new(EndpointTable::default()),
            ids: RefCell::new(InterfaceIdAllocator::new(namespace)),
            encountered_error: Cell::new(false),
            closed: Cell::new(false),
            validation_error_handler: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        inner
            .connector
            .set_incoming_receiver(Rc::new(move |message: Message| match weak.upgrade() {
                Some(inner) => Router { inner }.accept(message),
                None => false,
            }));
        let weak = Rc::downgrade(&inner);
        inner.connector.set_error_handler(Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                Router { inner }.on_pipe_connection_error();
            }
        }));

        tracing::debug!(target: "tether.router", ?namespace, "router created");
        Router { inner }
    }

    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.inner.runner
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn interface_id_namespace(&self) -> InterfaceIdNamespace {
        self.inner.ids.borrow().namespace()
    }

    /// Takes ownership of this side of endpoint `id`.
    ///
    /// Returns `None` for the invalid id, for a non-master id from this router's own namespace,
    /// and for an id that already has a handle or has been fully torn down.
    pub fn create_local_endpoint_handle(&self, id: InterfaceId) -> Option<EndpointHandle> {
        if !is_valid_interface_id(id) {
            return None;
        }
        if !self.inner.ids.borrow().is_acceptable_remote_id(id) {
            tracing::debug!(
                target: "tether.router",
                id,
                "refusing to adopt an id from this router's own namespace"
            );
            return None;
        }
        self.adopt_endpoint(id)
    }

    /// Allocates a fresh id in this router's namespace and returns its handle.
    ///
    /// The peer adopts the id with [`Router::create_local_endpoint_handle`].
    pub fn create_associated_endpoint_handle(&self) -> Option<EndpointHandle> {
        let id = {
            let endpoints = self.inner.endpoints.borrow();
            self.inner
                .ids
                .borrow_mut()
                .allocate(|id| endpoints.contains(id) || endpoints.is_retired(id))?
        };
        tracing::trace!(target: "tether.router", id, "associated endpoint allocated");
        self.adopt_endpoint(id)
    }

    fn adopt_endpoint(&self, id: InterfaceId) -> Option<EndpointHandle> {
        let encountered_error = self.inner.encountered_error.get();
        let removed = {
            let mut endpoints = self.inner.endpoints.borrow_mut();
            let endpoint = endpoints.find_or_insert(id)?;
            if endpoint.handle_created {
                return None;
            }
            debug_assert!(!endpoint.closed);
            endpoint.handle_created = true;
            if encountered_error {
                endpoints.update_state_may_remove(id, EndpointStateUpdate::PeerEndpointClosed)
            } else {
                None
            }
        };
        drop(removed);
        Some(EndpointHandle {
            id,
            router: self.downgrade(),
            closed: false,
        })
    }

    /// Wires `client` to the endpoint behind `handle`.
    ///
    /// Buffered messages and, if the peer is already gone, the error notification are delivered
    /// from posted tasks, in that order.
    pub fn attach_endpoint_client(&self, handle: &EndpointHandle, client: Rc<dyn EndpointClient>) {
        let id = handle.id();
        assert!(
            handle.belongs_to(self),
            "endpoint handle {id} belongs to another router"
        );
        assert!(
            is_valid_interface_id(id),
            "cannot attach a client to the invalid interface id"
        );
        let (peer_closed, reason, has_pending) = {
            let mut endpoints = self.inner.endpoints.borrow_mut();
            let Some(endpoint) = endpoints.get_mut(id) else {
                panic!("attaching a client to unknown endpoint {id}");
            };
            assert!(endpoint.client.is_none(), "endpoint {id} already has a client");
            assert!(!endpoint.closed, "endpoint {id} is already closed");
            endpoint.client = Some(client.clone());
            (
                endpoint.peer_closed,
                endpoint.disconnect_reason.clone(),
                !endpoint.pending.is_empty(),
            )
        };
        if has_pending {
            self.post_pending_dispatch(id);
        }
        if peer_closed {
            self.post_error_notification(client, reason);
        }
    }

    pub fn detach_endpoint_client(&self, handle: &EndpointHandle) {
        let id = handle.id();
        assert!(
            is_valid_interface_id(id),
            "cannot detach a client from the invalid interface id"
        );
        let client = {
            let mut endpoints = self.inner.endpoints.borrow_mut();
            let Some(endpoint) = endpoints.get_mut(id) else {
                panic!("detaching a client from unknown endpoint {id}");
            };
            assert!(endpoint.client.is_some(), "endpoint {id} has no client");
            assert!(!endpoint.closed, "endpoint {id} is already closed");
            endpoint.client.take()
        };
        drop(client);
    }

    /// Releases this side of endpoint `id` and tells the peer, except for a reasonless close of
    /// the master endpoint (the pipe closing says the same thing).
    pub fn close_endpoint_handle(&self, id: InterfaceId, reason: Option<DisconnectReason>) {
        if !is_valid_interface_id(id) {
            return;
        }
        let removed = {
            let mut endpoints = self.inner.endpoints.borrow_mut();
            let Some(endpoint) = endpoints.get_mut(id) else {
                panic!("closing unknown endpoint {id}");
            };
            assert!(
                endpoint.client.is_none(),
                "closing endpoint {id} while a client is attached"
            );
            assert!(!endpoint.closed, "endpoint {id} closed twice");
            endpoint.pending.clear();
            endpoints.update_state_may_remove(id, EndpointStateUpdate::EndpointClosed)
        };
        tracing::trace!(
            target: "tether.router",
            id,
            removed = removed.is_some(),
            "endpoint closed"
        );
        drop(removed);

        if !is_master_interface_id(id) || reason.is_some() {
            PipeControlMessageProxy::new(self.inner.connector.as_ref())
                .notify_peer_endpoint_closed(id, reason);
        }
    }

    /// Records that the peer released endpoint `id`. Returns false for notifications that
    /// violate the protocol.
    pub fn on_peer_associated_endpoint_closed(
        &self,
        id: InterfaceId,
        reason: Option<DisconnectReason>,
    ) -> bool {
        if !is_valid_interface_id(id) {
            return false;
        }
        // The master endpoint goes away with the pipe; announcing it without a reason is bogus.
        if is_master_interface_id(id) && reason.is_none() {
            return false;
        }
        // Ids from this router's namespace only exist once this side has allocated them.
        if !self.inner.ids.borrow().is_acceptable_remote_id(id) {
            let known = {
                let endpoints = self.inner.endpoints.borrow();
                endpoints.contains(id) || endpoints.is_retired(id)
            };
            if !known {
                self.report_validation_error(&ValidationError::UnexpectedInterfaceId { id });
                return false;
            }
        }

        let (client, reason, removed) = {
            let mut endpoints = self.inner.endpoints.borrow_mut();
            let Some(endpoint) = endpoints.find_or_insert(id) else {
                tracing::trace!(target: "tether.router", id, "peer closed a retired endpoint");
                return true;
            };
            if reason.is_some() {
                endpoint.disconnect_reason = reason;
            }
            if endpoint.peer_closed {
                return true;
            }
            let client = endpoint.client.clone();
            let reason = endpoint.disconnect_reason.clone();
            let removed =
                endpoints.update_state_may_remove(id, EndpointStateUpdate::PeerEndpointClosed);
            (client, reason, removed)
        };
        drop(removed);

        tracing::debug!(
            target: "tether.router",
            id,
            has_client = client.is_some(),
            "peer closed endpoint"
        );
        if let Some(client) = client {
            self.post_error_notification(client, reason);
        }
        true
    }

    /// Marks every endpoint peer-closed and notifies every attached client. Runs once.
    pub fn on_pipe_connection_error(&self) {
        if self.inner.encountered_error.replace(true) {
            return;
        }

        let (notifications, removed) = {
            let mut endpoints = self.inner.endpoints.borrow_mut();
            let mut notifications = Vec::new();
            let mut removed = Vec::new();
            for id in endpoints.ids() {
                if let Some(endpoint) = endpoints.get(id) {
                    if let Some(client) = &endpoint.client {
                        notifications.push((client.clone(), endpoint.disconnect_reason.clone()));
                    }
                }
                removed.extend(
                    endpoints.update_state_may_remove(id, EndpointStateUpdate::PeerEndpointClosed),
                );
            }
            (notifications, removed)
        };

        tracing::debug!(
            target: "tether.router",
            notified = notifications.len(),
            removed = removed.len(),
            "pipe connection error"
        );
        drop(removed);
        for (client, reason) in notifications {
            self.post_error_notification(client, reason);
        }
    }

    /// Entry point for every message read off the pipe.
    ///
    /// Returns false if the message was invalid; unless testing mode is on, the router has
    /// closed itself by the time this returns.
    pub fn accept(&self, message: Message) -> bool {
        let ok = match self.inner.validator.validate_header(&message) {
            Err(error) => {
                self.report_validation_error(&error);
                false
            }
            Ok(header) if is_pipe_control_message(&header) => {
                match PipeControlMessageHandler::new(self).accept(&message) {
                    Ok(ok) => ok,
                    Err(error) => {
                        self.report_validation_error(&error);
                        false
                    }
                }
            }
            Ok(header) => self.dispatch_to_endpoint(header.interface_id, message),
        };
        if !ok {
            self.handle_invalid_incoming_message();
        }
        ok
    }

    fn dispatch_to_endpoint(&self, id: InterfaceId, message: Message) -> bool {
        let client = {
            let mut endpoints = self.inner.endpoints.borrow_mut();
            let Some(endpoint) = endpoints.get_mut(id) else {
                tracing::trace!(target: "tether.router", id, "dropping message for unknown endpoint");
                return true;
            };
            if endpoint.closed {
                tracing::trace!(target: "tether.router", id, "dropping message for closed endpoint");
                return true;
            }
            match &endpoint.client {
                Some(client) if endpoint.pending.is_empty() => client.clone(),
                _ => {
                    let max = self.inner.config.max_pending_messages_per_endpoint;
                    if endpoint.pending.len() >= max {
                        drop(endpoints);
                        self.report_validation_error(&ValidationError::EndpointQueueFull { id, max });
                        return false;
                    }
                    endpoint.pending.push_back(message);
                    return true;
                }
            }
        };
        client.handle_incoming_message(&message)
    }

    fn post_pending_dispatch(&self, id: InterfaceId) {
        let router = self.downgrade();
        self.inner.runner.post_task(move || {
            if let Some(router) = router.upgrade() {
                router.dispatch_pending(id);
            }
        });
    }

    fn dispatch_pending(&self, id: InterfaceId) {
        loop {
            if self.inner.closed.get() {
                return;
            }
            let (client, message) = {
                let mut endpoints = self.inner.endpoints.borrow_mut();
                let Some(endpoint) = endpoints.get_mut(id) else {
                    return;
                };
                // A detached endpoint keeps its backlog for the next client.
                let Some(client) = endpoint.client.clone() else {
                    return;
                };
                let Some(message) = endpoint.pending.pop_front() else {
                    return;
                };
                (client, message)
            };
            // Outside testing mode a rejection closes the router, which ends the loop.
            if !client.handle_incoming_message(&message) {
                self.handle_invalid_incoming_message();
            }
        }
    }

    fn post_error_notification(
        &self,
        client: Rc<dyn EndpointClient>,
        reason: Option<DisconnectReason>,
    ) {
        self.inner
            .runner
            .post_task(move || client.notify_error(reason));
    }

    fn handle_invalid_incoming_message(&self) {
        if self.inner.testing_mode.get() {
            tracing::debug!(target: "tether.router", "invalid message ignored in testing mode");
            return;
        }
        tracing::warn!(target: "tether.router", "closing pipe after invalid message");
        self.close();
    }

    pub fn set_validation_error_handler(&self, handler: impl Fn(&ValidationError) + 'static) {
        *self.inner.validation_error_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Sends `error` to the validation-error sink.
    pub fn report_validation_error(&self, error: &ValidationError) {
        tracing::warn!(target: "tether.router", %error, "message failed validation");
        let handler = self.inner.validation_error_handler.borrow().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// Closes the connector and fails every endpoint as if the pipe had broken. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        tracing::debug!(target: "tether.router", "router closed");
        self.inner.connector.close();
        self.on_pipe_connection_error();
    }

    /// Sends an already addressed message. False once the pipe has failed or been closed.
    pub fn send_message(&self, message: Message) -> bool {
        if self.inner.encountered_error.get() {
            return false;
        }
        self.inner.connector.accept(message)
    }

    /// Takes the underlying pipe without closing it. The router can no longer send or receive.
    pub fn pass_message_pipe(&self) -> Option<PipeHandle> {
        self.inner.connector.pass_handle()
    }

    pub fn enable_testing_mode(&self) {
        self.inner.testing_mode.set(true);
    }

    pub fn is_testing_mode(&self) -> bool {
        self.inner.testing_mode.get()
    }

    pub fn wait_for_next_message_for_testing(&self) -> bool {
        self.inner.connector.wait_for_next_message_for_testing()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn encountered_error(&self) -> bool {
        self.inner.encountered_error.get()
    }

    pub fn endpoint_state(&self, id: InterfaceId) -> Option<EndpointState> {
        self.inner.endpoints.borrow().state(id)
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.borrow().len()
    }
}

impl PipeControlMessageDelegate for Router {
    fn on_peer_associated_endpoint_closed(
        &self,
        id: InterfaceId,
        reason: Option<DisconnectReason>,
    ) -> bool {
        Router::on_peer_associated_endpoint_closed(self, id, reason)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("namespace", &self.interface_id_namespace())
            .field("endpoints", &self.endpoint_count())
            .field("closed", &self.is_closed())
            .field("encountered_error", &self.encountered_error())
            .finish()
    }
}

/// This side's ownership of one endpoint. Dropping it closes the endpoint.
pub struct EndpointHandle {
    id: InterfaceId,
    router: WeakRouter,
    closed: bool,
}

impl EndpointHandle {
    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn is_master(&self) -> bool {
        is_master_interface_id(self.id)
    }

    pub fn router(&self) -> Option<Router> {
        self.router.upgrade()
    }

    pub fn belongs_to(&self, router: &Router) -> bool {
        Weak::ptr_eq(&self.router.inner, &Rc::downgrade(&router.inner))
    }

    pub fn close(mut self) {
        self.release(None);
    }

    pub fn close_with_reason(mut self, reason: DisconnectReason) {
        self.release(Some(reason));
    }

    fn release(&mut self, reason: Option<DisconnectReason>) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.close_endpoint_handle(self.id, reason);
        }
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        // A misuse panic may have left the endpoint in a state where closing panics again.
        if std::thread::panicking() {
            self.closed = true;
            return;
        }
        self.release(None);
    }
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}
