use crate::models::error::SyncError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use tokio::runtime::{Builder, Handle, Runtime};

pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Upper bound on worker threads for filesystem and archive work.
pub const DEFAULT_BLOCKING_THREADS: usize = 4;

static SHARED: OnceLock<Result<BlockingPool, SyncError>> = OnceLock::new();

/// Bounded pool of worker threads for blocking work. Idle workers are reused, and no
/// more than `max_threads` run at once; further jobs queue until one frees up.
///
/// The returned futures resolve on whichever thread polls them, so the single-threaded
/// scheduler can await them without running inside a tokio context.
#[derive(Clone)]
pub struct BlockingPool {
    handle: Handle,
    _runtime: Arc<Runtime>,
}

impl BlockingPool {
    pub fn new(max_threads: usize) -> Result<Self, SyncError> {
        let runtime = Builder::new_current_thread()
            .thread_name("mod-syncer-io")
            .max_blocking_threads(max_threads.max(1))
            .build()
            .map_err(|e| SyncError::unexpected(format!("blocking pool: {e}")))?;
        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Arc::new(runtime),
        })
    }

    /// Process-wide pool used by the default filesystem and archive implementations.
    pub fn shared() -> Result<Self, SyncError> {
        SHARED
            .get_or_init(|| Self::new(DEFAULT_BLOCKING_THREADS))
            .clone()
    }

    /// Queues `f` on the pool. The job is submitted immediately; the future only
    /// collects its result.
    pub fn run<F, R>(&self, f: F) -> impl Future<Output = Result<R, SyncError>> + 'static
    where
        F: FnOnce() -> Result<R, SyncError> + Send + 'static,
        R: Send + 'static,
    {
        let job = self.handle.spawn_blocking(f);
        async move {
            job.await
                .map_err(|e| SyncError::unexpected(format!("worker thread failed: {e}")))?
        }
    }
}

/// Drives one future on the calling thread, parking between polls.
#[cfg(test)]
pub(crate) fn block_on<F: Future>(fut: F) -> F::Output {
    use std::task::{Context, Poll, Wake, Waker};

    struct ThreadWaker(std::thread::Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut fut = std::pin::pin!(fut);
    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
        std::thread::park();
    }
}
