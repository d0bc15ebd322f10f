//! Interface pointers and bindings on top of [`tether_router::Router`].
//!
//! Generated interface code implements [`Interface`]: a proxy type that turns method calls into
//! messages sent through an [`InterfaceEndpointClient`], and a stub that turns incoming messages
//! back into calls on the implementation. The wrappers here own the routers:
//!
//! - [`InterfacePtrController`] on the calling side,
//! - [`Binding`] on the implementing side, and [`BindingSet`] for many bindings sharing one
//!   implementation.

mod binding;
mod binding_set;
mod endpoint_client;
mod interface;
mod interface_control;
mod interface_ptr;

pub use binding::Binding;
pub use binding_set::{BindingId, BindingSet};
pub use endpoint_client::{
    ConnectionErrorHandler, InterfaceEndpointClient, Responder, ResponseError, ResponseFuture,
};
pub use interface::{Interface, InterfacePtrInfo, InterfaceRequest, MessageReceiver};
pub use interface_ptr::{make_request, InterfacePtrController, VersionQuery};

pub use tether_proto::DisconnectReason;
pub use tether_router::{MessagePipe, PipeHandle, RouterConfig, TaskRunner};
