use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tether_config::RouterConfig;
use tether_proto::DisconnectReason;

use crate::binding::Binding;
use crate::interface::{Interface, InterfaceRequest};

/// Identifies a binding within its [`BindingSet`]. Never reused by the same set.
pub type BindingId = u64;

type SetErrorHandler = Rc<dyn Fn(BindingId, Option<DisconnectReason>)>;

struct Inner<I: Interface> {
    bindings: RefCell<BTreeMap<BindingId, Binding<I>>>,
    next_id: Cell<BindingId>,
    error_handler: RefCell<Option<SetErrorHandler>>,
    config: RouterConfig,
}

impl<I: Interface> Inner<I> {
    fn on_connection_error(&self, id: BindingId, reason: Option<DisconnectReason>) {
        let removed = self.bindings.borrow_mut().remove(&id);
        let Some(binding) = removed else {
            return;
        };
        drop(binding);
        tracing::debug!(
            target: "tether.bindings",
            interface = I::NAME,
            binding = id,
            ?reason,
            "binding removed after connection error"
        );
        let handler = self.error_handler.borrow().clone();
        if let Some(handler) = handler {
            handler(id, reason);
        }
    }
}

/// Many bindings, each to its own pipe, whose connection errors funnel into one handler.
///
/// A binding that hits a connection error is removed before the handler runs.
pub struct BindingSet<I: Interface> {
    inner: Rc<Inner<I>>,
}

impl<I: Interface> Default for BindingSet<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Interface> BindingSet<I> {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                bindings: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(0),
                error_handler: RefCell::new(None),
                config,
            }),
        }
    }

    pub fn add_binding(
        &self,
        implementation: Rc<I::Impl>,
        request: InterfaceRequest<I>,
    ) -> BindingId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let mut binding = Binding::with_config(implementation, self.inner.config.clone());
        binding.bind(request);
        let weak: Weak<Inner<I>> = Rc::downgrade(&self.inner);
        binding.set_connection_error_handler(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_error(id, reason);
            }
        });
        self.inner.bindings.borrow_mut().insert(id, binding);
        id
    }

    /// Closes and removes one binding without running the error handler.
    pub fn remove_binding(&self, id: BindingId) -> bool {
        let removed = self.inner.bindings.borrow_mut().remove(&id);
        removed.is_some()
    }

    pub fn set_connection_error_handler(
        &self,
        handler: impl Fn(BindingId, Option<DisconnectReason>) + 'static,
    ) {
        let previous = self.inner.error_handler.borrow_mut().replace(Rc::new(handler));
        drop(previous);
    }

    pub fn close_all_bindings(&self) {
        let bindings = std::mem::take(&mut *self.inner.bindings.borrow_mut());
        drop(bindings);
    }

    pub fn contains(&self, id: BindingId) -> bool {
        self.inner.bindings.borrow().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.bindings.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bindings.borrow().is_empty()
    }

    pub fn ids(&self) -> Vec<BindingId> {
        self.inner.bindings.borrow().keys().copied().collect()
    }
}

impl<I: Interface> Drop for BindingSet<I> {
    fn drop(&mut self) {
        self.close_all_bindings();
    }
}

impl<I: Interface> fmt::Debug for BindingSet<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingSet")
            .field("interface", &I::NAME)
            .field("ids", &self.ids())
            .finish()
    }
}
