//! Multiplexes many interface endpoints over one message pipe.
//!
//! The [`Router`] owns the pipe's [`Connector`] and an endpoint table keyed by interface id. Each
//! side of an endpoint is released independently: the local side through its [`EndpointHandle`],
//! the remote side through a pipe-control notification or a pipe-wide error. A record is dropped
//! once both halves are gone.
//!
//! Everything here is single-threaded. Notifications that must not re-enter the caller are posted
//! to a [`TaskRunner`], which spawns them onto a tokio `LocalSet`; they run in order whenever the
//! set is driven, e.g. by awaiting [`TaskRunner::run_until_idle`] on a current-thread runtime.

mod connector;
mod endpoint;
mod pipe;
mod pipe_control;
mod router;
mod runner;

pub use connector::{Connector, ConnectorErrorHandler, IncomingReceiver, PipeConnector};
pub use endpoint::{EndpointClient, EndpointState};
pub use pipe::{MessagePipe, PipeError, PipeHandle, PipeSignal};
pub use pipe_control::PipeControlMessageDelegate;
pub use router::{EndpointHandle, Router, ValidationErrorHandler, WeakRouter};
pub use runner::TaskRunner;

pub use tether_config::RouterConfig;
pub use tether_proto::{DisconnectReason, InterfaceId, InterfaceIdNamespace, Message};
