use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tether_config::RouterConfig;
use tether_proto::{
    DisconnectReason, InterfaceIdNamespace, MessageValidator, MASTER_INTERFACE_ID,
};
use tether_router::{MessagePipe, PipeHandle, Router, TaskRunner};
use tokio::sync::oneshot;

use crate::endpoint_client::{
    ConnectionErrorHandler, InterfaceEndpointClient, ResponseError, ResponseFuture,
};
use crate::interface::{Interface, InterfacePtrInfo, InterfaceRequest};
use crate::interface_control::ControlMessageProxy;

enum State<I: Interface> {
    Unbound,
    /// Bound to a pipe; the router is created the first time it is needed.
    Pending(PipeHandle),
    Bound {
        router: Router,
        client: Rc<InterfaceEndpointClient>,
        proxy: I::Proxy,
    },
}

/// Resolves with the remote version once a [`InterfacePtrController::query_version`] response
/// is dispatched.
#[derive(Debug)]
pub struct VersionQuery {
    rx: oneshot::Receiver<u32>,
}

impl Future for VersionQuery {
    type Output = Result<u32, ResponseError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ResponseError::Disconnected))
    }
}

/// Owns the calling end of an interface: a router over the pipe, its master endpoint and the
/// proxy that sends through it.
///
/// The cached version only ever rises while bound, either from a
/// [`query_version`](Self::query_version) response or a
/// [`require_version`](Self::require_version) call.
pub struct InterfacePtrController<I: Interface> {
    state: State<I>,
    version: Rc<Cell<u32>>,
    config: RouterConfig,
}

impl<I: Interface> Default for InterfacePtrController<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Interface> InterfacePtrController<I> {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            state: State::Unbound,
            version: Rc::new(Cell::new(0)),
            config,
        }
    }

    /// Takes ownership of `info`, resetting any previous binding first.
    pub fn bind(&mut self, info: InterfacePtrInfo<I>) {
        self.reset();
        self.version.set(info.version);
        self.state = State::Pending(info.handle);
    }

    pub fn bind_handle(&mut self, handle: PipeHandle, version: u32) {
        self.bind(InterfacePtrInfo::new(handle, version));
    }

    pub fn is_bound(&self) -> bool {
        !matches!(self.state, State::Unbound)
    }

    pub fn reset(&mut self) {
        self.close(None);
    }

    /// Like [`reset`](Self::reset), but the implementation's error handler receives the reason.
    pub fn reset_with_reason(&mut self, custom_reason: u32, description: impl Into<String>) {
        self.configure_if_necessary();
        self.close(Some(DisconnectReason::new(custom_reason, description)));
    }

    /// The proxy, creating the router on first use. `None` while unbound.
    pub fn proxy(&mut self) -> Option<&I::Proxy> {
        self.configure_if_necessary();
        match &self.state {
            State::Bound { proxy, .. } => Some(proxy),
            _ => None,
        }
    }

    /// Panics unless bound.
    pub fn set_connection_error_handler(
        &mut self,
        handler: impl Fn(Option<DisconnectReason>) + 'static,
    ) {
        assert!(self.is_bound(), "cannot set an error handler on an unbound {}", I::NAME);
        self.configure_if_necessary();
        if let State::Bound { client, .. } = &self.state {
            client.set_connection_error_handler(Rc::new(handler) as ConnectionErrorHandler);
        }
    }

    /// Unbinds and hands back the pipe so it can be bound elsewhere.
    ///
    /// Panics if responses are still outstanding. Returns `None` if unbound or if the pipe has
    /// already failed.
    pub fn pass_interface(&mut self) -> Option<InterfacePtrInfo<I>> {
        let version = self.version.replace(0);
        let handle = match std::mem::replace(&mut self.state, State::Unbound) {
            State::Unbound => return None,
            State::Pending(handle) => handle,
            State::Bound {
                router,
                client,
                proxy,
            } => {
                assert_eq!(
                    client.pending_responses(),
                    0,
                    "cannot pass {} while responses are outstanding",
                    I::NAME
                );
                drop(proxy);
                let handle = router.pass_message_pipe();
                client.close(None);
                handle?
            }
        };
        Some(InterfacePtrInfo::new(handle, version))
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    /// Asks the implementation for its version. The cached version is updated when the response
    /// is dispatched.
    pub fn query_version(&mut self) -> VersionQuery {
        let (tx, rx) = oneshot::channel();
        self.configure_if_necessary();
        if let State::Bound { client, .. } = &self.state {
            let cached = Rc::clone(&self.version);
            ControlMessageProxy::new(client).query_version(move |version| {
                cached.set(version);
                let _ = tx.send(version);
            });
        }
        VersionQuery { rx }
    }

    /// Tells the implementation to close the pipe unless it implements `version`. A no-op if the
    /// cached version already satisfies it; otherwise the cache is raised immediately.
    pub fn require_version(&mut self, version: u32) {
        assert!(self.is_bound(), "cannot require a version of an unbound {}", I::NAME);
        if version <= self.version.get() {
            return;
        }
        self.version.set(version);
        self.configure_if_necessary();
        if let State::Bound { client, .. } = &self.state {
            ControlMessageProxy::new(client).require_version(version);
        }
    }

    /// Resolves once the implementation has processed everything sent before it.
    pub fn flush_for_testing(&mut self) -> ResponseFuture {
        assert!(self.is_bound(), "cannot flush an unbound {}", I::NAME);
        self.configure_if_necessary();
        let State::Bound { client, .. } = &self.state else {
            unreachable!("configured above");
        };
        ControlMessageProxy::new(client).flush_for_testing()
    }

    pub fn encountered_error(&self) -> bool {
        match &self.state {
            State::Bound { client, .. } => client.encountered_error(),
            _ => false,
        }
    }

    pub fn router(&self) -> Option<&Router> {
        match &self.state {
            State::Bound { router, .. } => Some(router),
            _ => None,
        }
    }

    fn configure_if_necessary(&mut self) {
        let handle = match std::mem::replace(&mut self.state, State::Unbound) {
            State::Pending(handle) => handle,
            other => {
                self.state = other;
                return;
            }
        };
        let router = Router::new(handle, InterfaceIdNamespace::Client, self.config.clone());
        let endpoint = router
            .create_local_endpoint_handle(MASTER_INTERFACE_ID)
            .expect("a new router always hands out its master endpoint");
        let validator = MessageValidator::new(self.config.effective_max_message_len())
            .with_payload_validator(I::validate_response);
        let client = InterfaceEndpointClient::new(endpoint, None, validator, I::NAME, I::VERSION);
        let proxy = I::new_proxy(Rc::clone(&client));
        self.state = State::Bound {
            router,
            client,
            proxy,
        };
    }

    fn close(&mut self, reason: Option<DisconnectReason>) {
        match std::mem::replace(&mut self.state, State::Unbound) {
            State::Unbound | State::Pending(_) => {}
            State::Bound {
                router,
                client,
                proxy,
            } => {
                drop(proxy);
                client.close(reason);
                router.close();
            }
        }
        self.version.set(0);
    }
}

impl<I: Interface> Drop for InterfacePtrController<I> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<I: Interface> fmt::Debug for InterfacePtrController<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Unbound => "unbound",
            State::Pending(_) => "pending",
            State::Bound { .. } => "bound",
        };
        f.debug_struct("InterfacePtrController")
            .field("interface", &I::NAME)
            .field("state", &state)
            .field("version", &self.version())
            .finish()
    }
}

/// Binds `ptr` to a new pipe and returns the other end for an implementation to bind.
pub fn make_request<I: Interface>(
    ptr: &mut InterfacePtrController<I>,
    runner: &TaskRunner,
) -> InterfaceRequest<I> {
    let pipe = MessagePipe::new(runner);
    let (calling, implementing) = pipe.into_handles();
    ptr.bind(InterfacePtrInfo::new(calling, 0));
    InterfaceRequest::new(implementing)
}
