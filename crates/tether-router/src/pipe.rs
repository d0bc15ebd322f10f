//! In-process message pipes.
//!
//! A pipe has two ends. Writing on one end queues the message on the other. A watcher registered
//! on an end is only ever invoked from a task posted to the pipe's [`TaskRunner`], never from
//! inside `write`, so writers can't re-enter themselves.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tether_proto::Message;

use crate::runner::TaskRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("peer end of the pipe is closed")]
    PeerClosed,
}

/// What a watcher is told about its end of the pipe.
#[derive(Debug)]
pub enum PipeSignal {
    Readable(Message),
    /// The peer end closed and every message it wrote has already been delivered.
    PeerClosed,
}

type Watcher = Rc<dyn Fn(PipeSignal)>;

struct End {
    open: bool,
    incoming: VecDeque<Message>,
    watcher: Option<Watcher>,
    drain_posted: bool,
    peer_closed_signaled: bool,
}

impl End {
    fn new() -> Self {
        Self {
            open: true,
            incoming: VecDeque::new(),
            watcher: None,
            drain_posted: false,
            peer_closed_signaled: false,
        }
    }
}

struct PipeState {
    ends: [End; 2],
}

/// Both ends of a freshly created pipe.
pub struct MessagePipe {
    pub handle0: PipeHandle,
    pub handle1: PipeHandle,
}

impl MessagePipe {
    pub fn new(runner: &TaskRunner) -> Self {
        let state = Rc::new(RefCell::new(PipeState {
            ends: [End::new(), End::new()],
        }));
        Self {
            handle0: PipeHandle::new(state.clone(), 0, runner.clone()),
            handle1: PipeHandle::new(state, 1, runner.clone()),
        }
    }

    pub fn into_handles(self) -> (PipeHandle, PipeHandle) {
        (self.handle0, self.handle1)
    }
}

/// One end of a [`MessagePipe`]. Dropping it closes that end.
pub struct PipeHandle {
    state: Rc<RefCell<PipeState>>,
    side: usize,
    runner: TaskRunner,
}

impl PipeHandle {
    fn new(state: Rc<RefCell<PipeState>>, side: usize, runner: TaskRunner) -> Self {
        Self {
            state,
            side,
            runner,
        }
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn write(&self, message: Message) -> Result<(), PipeError> {
        let peer = self.peer();
        {
            let mut state = self.state.borrow_mut();
            if !state.ends[peer].open {
                return Err(PipeError::PeerClosed);
            }
            state.ends[peer].incoming.push_back(message);
        }
        tracing::trace!(target: "tether.pipe", side = peer, "message queued");
        schedule_drain(&self.state, peer, &self.runner);
        Ok(())
    }

    /// Takes the oldest queued message without waiting for the watcher.
    ///
    /// Returns `Ok(None)` when nothing is queued and the peer is still open.
    pub fn read(&self) -> Result<Option<Message>, PipeError> {
        let mut state = self.state.borrow_mut();
        if let Some(message) = state.ends[self.side].incoming.pop_front() {
            return Ok(Some(message));
        }
        if !state.ends[self.peer()].open {
            return Err(PipeError::PeerClosed);
        }
        Ok(None)
    }

    pub fn queued_messages(&self) -> usize {
        self.state.borrow().ends[self.side].incoming.len()
    }

    pub fn is_peer_closed(&self) -> bool {
        !self.state.borrow().ends[self.peer()].open
    }

    /// Registers `watcher` for this end, replacing any previous one.
    ///
    /// Anything already queued (and a pending peer closure) is delivered from a posted task.
    pub fn watch(&self, watcher: impl Fn(PipeSignal) + 'static) {
        self.state.borrow_mut().ends[self.side].watcher = Some(Rc::new(watcher));
        schedule_drain(&self.state, self.side, &self.runner);
    }

    pub fn cancel_watch(&self) {
        // Take the watcher out first so it is dropped without the state borrowed.
        let watcher = self.state.borrow_mut().ends[self.side].watcher.take();
        drop(watcher);
    }

    pub fn close(self) {}
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        let (watcher, discarded) = {
            let mut state = self.state.borrow_mut();
            let end = &mut state.ends[self.side];
            end.open = false;
            (end.watcher.take(), std::mem::take(&mut end.incoming))
        };
        drop(watcher);
        tracing::trace!(
            target: "tether.pipe",
            side = self.side,
            discarded = discarded.len(),
            "pipe end closed"
        );
        schedule_drain(&self.state, self.peer(), &self.runner);
    }
}

impl fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeHandle")
            .field("side", &self.side)
            .field("queued", &self.queued_messages())
            .field("peer_closed", &self.is_peer_closed())
            .finish()
    }
}

fn schedule_drain(state: &Rc<RefCell<PipeState>>, side: usize, runner: &TaskRunner) {
    {
        let mut state = state.borrow_mut();
        let end = &mut state.ends[side];
        if end.drain_posted || end.watcher.is_none() || !end.open {
            return;
        }
        end.drain_posted = true;
    }
    let weak: Weak<RefCell<PipeState>> = Rc::downgrade(state);
    runner.post_task(move || {
        if let Some(state) = weak.upgrade() {
            drain(&state, side);
        }
    });
}

fn drain(state: &Rc<RefCell<PipeState>>, side: usize) {
    state.borrow_mut().ends[side].drain_posted = false;
    loop {
        let (watcher, signal) = {
            let mut state = state.borrow_mut();
            let peer_open = state.ends[1 - side].open;
            let end = &mut state.ends[side];
            let Some(watcher) = end.watcher.clone() else {
                return;
            };
            if !end.open {
                return;
            }
            if let Some(message) = end.incoming.pop_front() {
                (watcher, PipeSignal::Readable(message))
            } else if !peer_open && !end.peer_closed_signaled {
                end.peer_closed_signaled = true;
                (watcher, PipeSignal::PeerClosed)
            } else {
                return;
            }
        };
        watcher(signal);
    }
}
