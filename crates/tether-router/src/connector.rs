use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tether_proto::Message;

use crate::pipe::{PipeError, PipeHandle, PipeSignal};

/// Receives every message read off the pipe. Returns false if the message was invalid.
pub type IncomingReceiver = Rc<dyn Fn(Message) -> bool>;
pub type ConnectorErrorHandler = Rc<dyn Fn()>;

/// Frames and delivers opaque messages over one physical channel.
pub trait Connector {
    fn set_incoming_receiver(&self, receiver: IncomingReceiver);

    /// `handler` runs at most once, when the channel fails. It never runs because of
    /// [`Connector::close`].
    fn set_error_handler(&self, handler: ConnectorErrorHandler);

    /// Sends `message`. Returns false once the connector is closed or has failed.
    fn accept(&self, message: Message) -> bool;

    fn close(&self);

    /// Hands the underlying channel out without closing it. The connector is closed afterwards.
    fn pass_handle(&self) -> Option<PipeHandle>;

    fn encountered_error(&self) -> bool;

    /// Dispatches the next already-queued incoming message, if any.
    fn wait_for_next_message_for_testing(&self) -> bool {
        false
    }
}

/// A [`Connector`] over an in-process [`PipeHandle`].
pub struct PipeConnector {
    shared: Rc<Shared>,
}

struct Shared {
    handle: RefCell<Option<PipeHandle>>,
    receiver: RefCell<Option<IncomingReceiver>>,
    error_handler: RefCell<Option<ConnectorErrorHandler>>,
    encountered_error: Cell<bool>,
}

impl PipeConnector {
    pub fn new(handle: PipeHandle) -> Self {
        let shared = Rc::new(Shared {
            handle: RefCell::new(None),
            receiver: RefCell::new(None),
            error_handler: RefCell::new(None),
            encountered_error: Cell::new(false),
        });
        let weak: Weak<Shared> = Rc::downgrade(&shared);
        handle.watch(move |signal| {
            if let Some(shared) = weak.upgrade() {
                shared.on_signal(signal);
            }
        });
        *shared.handle.borrow_mut() = Some(handle);
        Self { shared }
    }
}

impl Shared {
    fn on_signal(&self, signal: PipeSignal) {
        match signal {
            PipeSignal::Readable(message) => {
                self.dispatch(message);
            }
            PipeSignal::PeerClosed => self.handle_error(),
        }
    }

    fn dispatch(&self, message: Message) -> bool {
        let receiver = self.receiver.borrow().clone();
        match receiver {
            Some(receiver) => receiver(message),
            None => {
                tracing::trace!(target: "tether.pipe", "no receiver; dropping message");
                false
            }
        }
    }

    fn handle_error(&self) {
        if self.encountered_error.replace(true) {
            return;
        }
        tracing::debug!(target: "tether.pipe", "connection error");
        let handle = self.handle.borrow_mut().take();
        drop(handle);
        let handler = self.error_handler.borrow().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn take_handle(&self) -> Option<PipeHandle> {
        let handle = self.handle.borrow_mut().take();
        if let Some(handle) = &handle {
            handle.cancel_watch();
        }
        handle
    }
}

impl Connector for PipeConnector {
    fn set_incoming_receiver(&self, receiver: IncomingReceiver) {
        *self.shared.receiver.borrow_mut() = Some(receiver);
    }

    fn set_error_handler(&self, handler: ConnectorErrorHandler) {
        *self.shared.error_handler.borrow_mut() = Some(handler);
    }

    fn accept(&self, message: Message) -> bool {
        if self.shared.encountered_error.get() {
            return false;
        }
        let handle = self.shared.handle.borrow();
        let Some(handle) = handle.as_ref() else {
            return false;
        };
        match handle.write(message) {
            Ok(()) => true,
            // The read side reports the failure once everything the peer wrote is delivered.
            Err(PipeError::PeerClosed) => true,
        }
    }

    fn close(&self) {
        let handle = self.shared.take_handle();
        if handle.is_some() {
            tracing::debug!(target: "tether.pipe", "connector closed");
        }
        drop(handle);
    }

    fn pass_handle(&self) -> Option<PipeHandle> {
        self.shared.take_handle()
    }

    fn encountered_error(&self) -> bool {
        self.shared.encountered_error.get()
    }

    fn wait_for_next_message_for_testing(&self) -> bool {
        let next = match self.shared.handle.borrow().as_ref() {
            Some(handle) => handle.read(),
            None => return false,
        };
        match next {
            Ok(Some(message)) => self.shared.dispatch(message),
            Ok(None) => false,
            Err(PipeError::PeerClosed) => {
                self.shared.handle_error();
                false
            }
        }
    }
}

impl Drop for PipeConnector {
    fn drop(&mut self) {
        self.close();
    }
}
