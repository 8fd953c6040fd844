use crate::models::error::SyncError;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::pin::pin;
use std::rc::Rc;
use std::task::{Poll, Waker};

#[derive(Default)]
struct CancelState {
    reason: RefCell<Option<SyncError>>,
    waiters: RefCell<HashMap<u64, Waker>>,
    next_waiter: Cell<u64>,
}

impl CancelState {
    fn cancel(&self, reason: SyncError) {
        {
            let mut current = self.reason.borrow_mut();
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waker in waiters.into_values() {
            waker.wake();
        }
    }

    fn register(&self, key: &mut Option<u64>, waker: &Waker) {
        let key = *key.get_or_insert_with(|| {
            let next = self.next_waiter.get();
            self.next_waiter.set(next.wrapping_add(1));
            next
        });
        let mut waiters = self.waiters.borrow_mut();
        match waiters.get_mut(&key) {
            Some(current) if current.will_wake(waker) => {}
            Some(current) => *current = waker.clone(),
            None => {
                waiters.insert(key, waker.clone());
            }
        }
    }
}

/// One guarded future's waker slot on a token. Dropping it removes the slot.
struct Waiter<'a> {
    state: &'a CancelState,
    key: Option<u64>,
}

impl<'a> Waiter<'a> {
    fn new(state: &'a CancelState) -> Self {
        Self { state, key: None }
    }

    fn register(&mut self, waker: &Waker) {
        self.state.register(&mut self.key, waker);
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.state.waiters.borrow_mut().remove(&key);
        }
    }
}

/// Cooperative cancellation shared between the task that runs an operation and the
/// code that wants to stop it. A child token is also cancelled by its parent.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Rc<CancelState>,
    parent: Option<Rc<CancelState>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            state: Rc::new(CancelState::default()),
            parent: Some(self.state.clone()),
        }
    }

    pub fn cancel(&self, reason: SyncError) {
        self.state.cancel(reason);
    }

    pub fn reason(&self) -> Option<SyncError> {
        if let Some(reason) = self.state.reason.borrow().clone() {
            return Some(reason);
        }
        self.parent
            .as_ref()
            .and_then(|parent| parent.reason.borrow().clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Fails with the cancellation reason, for checks between steps.
    pub fn check(&self) -> Result<(), SyncError> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Drives `fut` until it completes or the token is cancelled, whichever comes first.
    /// A cancelled future is dropped at its current suspension point.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        let mut fut = pin!(fut);
        let mut own = Waiter::new(&self.state);
        let mut inherited = self.parent.as_deref().map(Waiter::new);
        poll_fn(|cx| {
            if let Some(reason) = self.reason() {
                return Poll::Ready(Err(reason));
            }
            own.register(cx.waker());
            if let Some(parent) = inherited.as_mut() {
                parent.register(cx.waker());
            }
            fut.as_mut().poll(cx)
        })
        .await
    }

    #[cfg(test)]
    fn waiter_count(&self) -> (usize, usize) {
        (
            self.state.waiters.borrow().len(),
            self.parent.as_ref().map_or(0, |p| p.waiters.borrow().len()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::sync::Arc;
    use std::task::{Context, Wake};

    struct Noop;

    impl Wake for Noop {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn parent_cancellation_reaches_children() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(child.check().is_ok());

        parent.cancel(SyncError::OperationCanceled);
        assert_eq!(child.check(), Err(SyncError::OperationCanceled));
    }

    #[test]
    fn first_reason_wins() {
        let token = CancelToken::new();
        token.cancel(SyncError::InstallOrUpdateCancelled);
        token.cancel(SyncError::OperationCanceled);
        assert_eq!(token.reason(), Some(SyncError::InstallOrUpdateCancelled));
    }

    #[test]
    fn guard_resolves_with_reason_once_cancelled() {
        let token = CancelToken::new();
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);

        let mut guarded = Box::pin(token.guard(pending::<Result<(), SyncError>>()));
        assert!(guarded.as_mut().poll(&mut cx).is_pending());

        token.cancel(SyncError::OperationCanceled);
        assert_eq!(
            guarded.as_mut().poll(&mut cx),
            Poll::Ready(Err(SyncError::OperationCanceled))
        );
    }

    #[test]
    fn finished_and_dropped_guards_leave_no_wakers_behind() {
        let root = CancelToken::new();
        let token = root.child();
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);

        for _ in 0..1000 {
            let mut done = Box::pin(token.guard(async { Ok::<_, SyncError>(()) }));
            assert_eq!(done.as_mut().poll(&mut cx), Poll::Ready(Ok(())));
        }
        assert_eq!(token.waiter_count(), (0, 0));

        for _ in 0..1000 {
            let mut waiting = Box::pin(token.guard(pending::<Result<(), SyncError>>()));
            assert!(waiting.as_mut().poll(&mut cx).is_pending());
            assert!(waiting.as_mut().poll(&mut cx).is_pending());
            assert_eq!(token.waiter_count(), (1, 1));
        }
        assert_eq!(token.waiter_count(), (0, 0));
    }
}
