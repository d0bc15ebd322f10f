use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use tether_proto::{Message, MessageHeader, ValidationError};
use tether_router::PipeHandle;

use crate::endpoint_client::{InterfaceEndpointClient, Responder};

/// The contract generated interface code fulfils.
pub trait Interface: 'static {
    /// Fully qualified interface name, used in logs and validation errors.
    const NAME: &'static str;
    /// Highest interface version this code implements.
    const VERSION: u32;

    type Proxy;
    type Impl: ?Sized + 'static;

    fn new_proxy(client: Rc<InterfaceEndpointClient>) -> Self::Proxy;

    fn new_stub(implementation: Rc<Self::Impl>) -> Box<dyn MessageReceiver>;

    /// Checks an incoming request before the stub sees it.
    fn validate_request(_message: &Message, _header: &MessageHeader) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Checks an incoming response before it resolves a pending call.
    fn validate_response(
        _message: &Message,
        _header: &MessageHeader,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Dispatch target for incoming requests; implemented by generated stubs.
pub trait MessageReceiver {
    /// Handles a one-way message. Returns false if it could not be dispatched.
    fn accept(&self, message: &Message) -> bool;

    /// Handles a request that expects a response, to be sent through `responder`.
    fn accept_with_responder(&self, message: &Message, responder: Responder) -> bool;
}

/// The implementing end of a pipe, waiting to be bound.
pub struct InterfaceRequest<I: Interface> {
    handle: PipeHandle,
    _interface: PhantomData<fn() -> I>,
}

impl<I: Interface> InterfaceRequest<I> {
    pub fn new(handle: PipeHandle) -> Self {
        Self {
            handle,
            _interface: PhantomData,
        }
    }

    pub fn into_handle(self) -> PipeHandle {
        self.handle
    }
}

impl<I: Interface> fmt::Debug for InterfaceRequest<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceRequest")
            .field("interface", &I::NAME)
            .field("handle", &self.handle)
            .finish()
    }
}

/// The calling end of a pipe plus the interface version already negotiated for it.
pub struct InterfacePtrInfo<I: Interface> {
    pub handle: PipeHandle,
    pub version: u32,
    _interface: PhantomData<fn() -> I>,
}

impl<I: Interface> InterfacePtrInfo<I> {
    pub fn new(handle: PipeHandle, version: u32) -> Self {
        Self {
            handle,
            version,
            _interface: PhantomData,
        }
    }
}

impl<I: Interface> fmt::Debug for InterfacePtrInfo<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfacePtrInfo")
            .field("interface", &I::NAME)
            .field("version", &self.version)
            .finish()
    }
}
