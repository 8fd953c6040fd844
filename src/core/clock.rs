use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Cell<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

type TimerKey = (Instant, u64);

/// Pending wake-ups, fired by the scheduler each time it is pumped.
pub struct Timers {
    clock: Rc<dyn Clock>,
    pending: RefCell<BTreeMap<TimerKey, Waker>>,
    seq: Cell<u64>,
}

impl Timers {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: RefCell::new(BTreeMap::new()),
            seq: Cell::new(0),
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn sleep(self: &Rc<Self>, duration: Duration) -> Sleep {
        self.sleep_until(self.now() + duration)
    }

    pub fn sleep_until(self: &Rc<Self>, deadline: Instant) -> Sleep {
        Sleep {
            timers: self.clone(),
            deadline,
            key: None,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Wakes every timer whose deadline has passed.
    pub fn fire_expired(&self) {
        let now = self.clock.now();
        let expired = {
            let mut pending = self.pending.borrow_mut();
            let later = pending.split_off(&(now, u64::MAX));
            std::mem::replace(&mut *pending, later)
        };
        for waker in expired.into_values() {
            waker.wake();
        }
    }

    fn register(&self, deadline: Instant, waker: &Waker) -> TimerKey {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        let key = (deadline, seq);
        self.pending.borrow_mut().insert(key, waker.clone());
        key
    }

    fn refresh(&self, key: TimerKey, waker: &Waker) {
        self.pending.borrow_mut().insert(key, waker.clone());
    }

    fn cancel(&self, key: TimerKey) {
        self.pending.borrow_mut().remove(&key);
    }
}

/// Completes once the clock reaches the deadline. Dropping it cancels the timer.
pub struct Sleep {
    timers: Rc<Timers>,
    deadline: Instant,
    key: Option<TimerKey>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.timers.now() >= self.deadline {
            if let Some(key) = self.key.take() {
                self.timers.cancel(key);
            }
            return Poll::Ready(());
        }

        let key = match self.key {
            Some(key) => {
                self.timers.refresh(key, cx.waker());
                key
            }
            None => self.timers.register(self.deadline, cx.waker()),
        };
        self.key = Some(key);
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.timers.cancel(key);
        }
    }
}
