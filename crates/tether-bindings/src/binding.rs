use std::fmt;
use std::rc::Rc;

use tether_config::RouterConfig;
use tether_proto::{
    DisconnectReason, InterfaceIdNamespace, MessageValidator, MASTER_INTERFACE_ID,
};
use tether_router::{MessagePipe, Router, TaskRunner};

use crate::endpoint_client::InterfaceEndpointClient;
use crate::interface::{Interface, InterfacePtrInfo, InterfaceRequest};
use crate::interface_ptr::InterfacePtrController;

struct Bound {
    router: Router,
    client: Rc<InterfaceEndpointClient>,
}

/// Connects one implementation to the implementing end of a pipe.
///
/// Dropping a bound binding closes the pipe.
pub struct Binding<I: Interface> {
    implementation: Rc<I::Impl>,
    config: RouterConfig,
    bound: Option<Bound>,
}

impl<I: Interface> Binding<I> {
    pub fn new(implementation: Rc<I::Impl>) -> Self {
        Self::with_config(implementation, RouterConfig::default())
    }

    pub fn with_config(implementation: Rc<I::Impl>, config: RouterConfig) -> Self {
        Self {
            implementation,
            config,
            bound: None,
        }
    }

    pub fn with_request(implementation: Rc<I::Impl>, request: InterfaceRequest<I>) -> Self {
        let mut binding = Self::new(implementation);
        binding.bind(request);
        binding
    }

    /// Closes any previous binding first.
    pub fn bind(&mut self, request: InterfaceRequest<I>) {
        self.close();
        let router = Router::new(
            request.into_handle(),
            InterfaceIdNamespace::Service,
            self.config.clone(),
        );
        let endpoint = router
            .create_local_endpoint_handle(MASTER_INTERFACE_ID)
            .expect("a new router always hands out its master endpoint");
        let validator = MessageValidator::new(self.config.effective_max_message_len())
            .with_payload_validator(I::validate_request);
        let stub = I::new_stub(Rc::clone(&self.implementation));
        let client =
            InterfaceEndpointClient::new(endpoint, Some(stub), validator, I::NAME, I::VERSION);
        tracing::debug!(target: "tether.bindings", interface = I::NAME, "binding bound");
        self.bound = Some(Bound { router, client });
    }

    /// Creates a pipe, binds this end and returns a pointer to the other.
    pub fn create_interface_ptr_and_bind(
        &mut self,
        runner: &TaskRunner,
    ) -> InterfacePtrController<I> {
        let (calling, implementing) = MessagePipe::new(runner).into_handles();
        self.bind(InterfaceRequest::new(implementing));
        let mut ptr = InterfacePtrController::with_config(self.config.clone());
        ptr.bind(InterfacePtrInfo::new(calling, I::VERSION));
        ptr
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn close(&mut self) {
        self.close_inner(None);
    }

    /// Closes the pipe; the remote pointer's error handler receives the reason.
    pub fn close_with_reason(&mut self, custom_reason: u32, description: impl Into<String>) {
        self.close_inner(Some(DisconnectReason::new(custom_reason, description)));
    }

    /// Stops serving and hands back the pipe, keeping anything the peer already sent queued on
    /// it. `None` if unbound or if the pipe has failed.
    pub fn unbind(&mut self) -> Option<InterfaceRequest<I>> {
        let Bound { router, client } = self.bound.take()?;
        let handle = router.pass_message_pipe();
        client.close(None);
        handle.map(InterfaceRequest::new)
    }

    /// Panics unless bound.
    pub fn set_connection_error_handler(
        &self,
        handler: impl Fn(Option<DisconnectReason>) + 'static,
    ) {
        let Some(bound) = &self.bound else {
            panic!("cannot set an error handler on an unbound {} binding", I::NAME);
        };
        bound.client.set_connection_error_handler(Rc::new(handler));
    }

    pub fn encountered_error(&self) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|bound| bound.client.encountered_error())
    }

    pub fn implementation(&self) -> &Rc<I::Impl> {
        &self.implementation
    }

    pub fn router(&self) -> Option<&Router> {
        self.bound.as_ref().map(|bound| &bound.router)
    }

    fn close_inner(&mut self, reason: Option<DisconnectReason>) {
        let Some(Bound { router, client }) = self.bound.take() else {
            return;
        };
        client.close(reason);
        router.close();
        tracing::debug!(target: "tether.bindings", interface = I::NAME, "binding closed");
    }
}

impl<I: Interface> Drop for Binding<I> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<I: Interface> fmt::Debug for Binding<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("interface", &I::NAME)
            .field("bound", &self.is_bound())
            .finish()
    }
}
