use crate::core::clock::Timers;
use crate::models::error::SyncError;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Wake, Waker};
use tracing::trace;

pub type TaskId = u64;

struct Task {
    future: Pin<Box<dyn Future<Output = ()>>>,
    waker: Waker,
}

/// Ids of tasks ready to be polled. Shared with wakers, which may fire on any thread.
#[derive(Default)]
struct ReadyQueue {
    ids: Mutex<VecDeque<TaskId>>,
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.ids.lock().push_back(self.id);
    }
}

/// Single-threaded cooperative executor. Work only runs inside `pump`, on the thread
/// that owns the scheduler; other threads can only mark tasks ready through wakers.
pub struct Scheduler {
    tasks: RefCell<HashMap<TaskId, Task>>,
    ready: Arc<ReadyQueue>,
    next_id: Cell<TaskId>,
    pumping: Cell<bool>,
    timers: Rc<Timers>,
}

/// Marks the scheduler as pumping until dropped.
pub struct PumpGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.pumping.set(false);
    }
}

impl Scheduler {
    pub fn new(timers: Rc<Timers>) -> Self {
        Self {
            tasks: RefCell::new(HashMap::new()),
            ready: Arc::new(ReadyQueue::default()),
            next_id: Cell::new(0),
            pumping: Cell::new(false),
            timers,
        }
    }

    pub fn timers(&self) -> &Rc<Timers> {
        &self.timers
    }

    /// Queues a unit of work. It is never polled before the next pump.
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            ready: self.ready.clone(),
        }));
        self.tasks.borrow_mut().insert(
            id,
            Task {
                future: Box::pin(future),
                waker,
            },
        );
        self.ready.ids.lock().push_back(id);
        trace!(task = id, "task enqueued");
        id
    }

    pub fn live_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_pumping(&self) -> bool {
        self.pumping.get()
    }

    pub fn enter(&self) -> Result<PumpGuard<'_>, SyncError> {
        if self.pumping.replace(true) {
            return Err(SyncError::ReentrantPump);
        }
        Ok(PumpGuard { scheduler: self })
    }

    /// Runs every task that is ready, including tasks woken while this call is running,
    /// and returns once nothing is left to poll.
    pub fn pump(&self) -> Result<(), SyncError> {
        let _guard = self.enter()?;
        self.run_until_stalled();
        Ok(())
    }

    pub(crate) fn run_until_stalled(&self) {
        loop {
            self.timers.fire_expired();

            let next = self.ready.ids.lock().pop_front();
            let Some(id) = next else {
                break;
            };

            // Completed tasks can still have stale wake-ups queued.
            let Some(mut task) = self.tasks.borrow_mut().remove(&id) else {
                continue;
            };

            let mut cx = Context::from_waker(&task.waker);
            if task.future.as_mut().poll(&mut cx).is_pending() {
                self.tasks.borrow_mut().insert(id, task);
            } else {
                trace!(task = id, "task finished");
            }
        }
    }
}
