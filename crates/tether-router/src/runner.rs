use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use tokio::task::LocalSet;

/// Deferred, single-threaded work for one or more routers.
///
/// Posted tasks are spawned onto a tokio [`LocalSet`] and run in post order whenever the set is
/// driven, which is what [`TaskRunner::run_until_idle`] does. Cloning yields another handle to the
/// same set.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Rc<RunnerInner>,
}

struct RunnerInner {
    local: LocalSet,
    pending: Cell<usize>,
    executed: Cell<u64>,
    panic: RefCell<Option<Box<dyn Any + Send>>>,
}

/// Keeps the counters right even when the task unwinds.
struct Completion(Weak<RunnerInner>);

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            inner.pending.set(inner.pending.get() - 1);
            inner.executed.set(inner.executed.get() + 1);
        }
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RunnerInner {
                local: LocalSet::new(),
                pending: Cell::new(0),
                executed: Cell::new(0),
                panic: RefCell::new(None),
            }),
        }
    }

    pub fn post_task(&self, task: impl FnOnce() + 'static) {
        self.inner.pending.set(self.inner.pending.get() + 1);
        let completion = Completion(Rc::downgrade(&self.inner));
        self.inner.local.spawn_local(async move {
            let completion = completion;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                if let Some(inner) = completion.0.upgrade() {
                    inner.panic.borrow_mut().get_or_insert(payload);
                }
            }
            drop(completion);
        });
    }

    /// Drives the set until no posted task is left, including tasks posted while running.
    /// Returns how many tasks ran.
    ///
    /// Must be awaited inside a tokio runtime. A panic inside a task is resumed here.
    pub async fn run_until_idle(&self) -> usize {
        let before = self.executed_tasks();
        self.drive(|| false).await;
        (self.executed_tasks() - before) as usize
    }

    /// Drives the set until `done` returns true or nothing is left to run. Returns the final
    /// `done()`.
    pub async fn run_until(&self, mut done: impl FnMut() -> bool) -> bool {
        self.drive(&mut done).await;
        done()
    }

    async fn drive(&self, mut done: impl FnMut() -> bool) {
        let inner = &self.inner;
        inner
            .local
            .run_until(async {
                while inner.pending.get() > 0 && inner.panic.borrow().is_none() && !done() {
                    tokio::task::yield_now().await;
                }
            })
            .await;
        let panicked = inner.panic.borrow_mut().take();
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.pending.get()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0
    }

    pub fn executed_tasks(&self) -> u64 {
        self.inner.executed.get()
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("pending", &self.pending_tasks())
            .field("executed", &self.executed_tasks())
            .finish()
    }
}
