use crate::config::ManagementConfig;
use crate::core::archive::ArchiveCodec;
use crate::core::cancel::CancelToken;
use crate::core::clock::{Clock, Timers};
use crate::core::filesystem::Filesystem;
use crate::core::queue::PendingWorkQueue;
use crate::core::store::ModStore;
use crate::core::transport::Transport;
use crate::models::error::SyncError;
use crate::models::event::{EventType, ModManagementEvent, ModProgressInfo};
use crate::models::ids::{ModId, UserId};
use crate::models::paths::RootPathRules;
use crate::models::subscription::UserRecord;
use crate::models::work::{WorkKind, WorkScope};
use crate::utils::json::Json;
use camino::Utf8PathBuf;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::future::poll_fn;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Poll, Waker};
use std::time::Instant;
use tracing::{error, info};

/// Platform services the engine depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Rc<dyn Transport>,
    pub filesystem: Rc<dyn Filesystem>,
    pub archive: Rc<dyn ArchiveCodec>,
    pub clock: Rc<dyn Clock>,
}

pub type EventCallback = Rc<dyn Fn(ModManagementEvent)>;

pub struct InFlight {
    pub mod_id: ModId,
    pub kind: WorkKind,
    pub scope: WorkScope,
    pub token: CancelToken,
}

pub struct PendingUpload {
    pub source: Utf8PathBuf,
    pub retries_remaining: u8,
}

#[derive(Default)]
pub struct ManagementState {
    pub enabled: bool,
    pub callback: Option<EventCallback>,
    pub queue: PendingWorkQueue,
    pub prioritized: Option<ModId>,
    /// The single execution slot shared by the loop and forced removals.
    pub in_flight: Option<InFlight>,
    pub progress: Option<ModProgressInfo>,
    pub uploads: BTreeMap<ModId, PendingUpload>,
    pub loop_running: bool,
}

/// Session state owned by the scheduler thread. Each part sits in its own cell so no
/// borrow has to be held across a suspension point.
pub struct ModContext {
    pub config: ManagementConfig,
    pub paths: RootPathRules,
    pub store: RefCell<ModStore>,
    pub users: RefCell<BTreeMap<UserId, UserRecord>>,
    pub management: RefCell<ManagementState>,
    pub temp_set: RefCell<Option<BTreeSet<ModId>>>,
    pub sync_running: Cell<bool>,
    pub shutdown: CancelToken,
    pub transport: Rc<dyn Transport>,
    pub filesystem: Rc<dyn Filesystem>,
    pub archive: Rc<dyn ArchiveCodec>,
    pub timers: Rc<Timers>,
    active_ops: Cell<usize>,
    drain_waker: RefCell<Option<Waker>>,
    loop_signal: Cell<bool>,
    loop_waker: RefCell<Option<Waker>>,
    slot_waiters: RefCell<Vec<Waker>>,
    persist_running: Cell<bool>,
    persist_dirty: Cell<bool>,
}

/// Counts an operation that shutdown has to wait for.
pub struct OpGuard<'a> {
    ctx: &'a ModContext,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.ctx.active_ops.get().saturating_sub(1);
        self.ctx.active_ops.set(remaining);
        if remaining == 0 {
            if let Some(waker) = self.ctx.drain_waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }
}

/// Held while a subscription sync runs; refuses a second one.
pub struct SyncGuard<'a> {
    ctx: &'a ModContext,
}

impl<'a> SyncGuard<'a> {
    pub fn acquire(ctx: &'a ModContext) -> Result<Self, SyncError> {
        if ctx.sync_running.replace(true) {
            return Err(SyncError::RequestInProgress);
        }
        Ok(Self { ctx })
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.ctx.sync_running.set(false);
    }
}

struct PersistGuard<'a> {
    running: &'a Cell<bool>,
}

impl Drop for PersistGuard<'_> {
    fn drop(&mut self) {
        self.running.set(false);
    }
}

impl ModContext {
    pub fn new(config: ManagementConfig, deps: &Collaborators, timers: Rc<Timers>) -> Self {
        let paths = config.paths();
        Self {
            store: RefCell::new(ModStore::new(paths.clone(), config.max_retries_per_session)),
            paths,
            config,
            users: RefCell::new(BTreeMap::new()),
            management: RefCell::new(ManagementState::default()),
            temp_set: RefCell::new(None),
            sync_running: Cell::new(false),
            shutdown: CancelToken::new(),
            transport: deps.transport.clone(),
            filesystem: deps.filesystem.clone(),
            archive: deps.archive.clone(),
            timers,
            active_ops: Cell::new(0),
            drain_waker: RefCell::new(None),
            loop_signal: Cell::new(false),
            loop_waker: RefCell::new(None),
            slot_waiters: RefCell::new(Vec::new()),
            persist_running: Cell::new(false),
            persist_dirty: Cell::new(false),
        }
    }

    pub fn now(&self) -> Instant {
        self.timers.now()
    }

    pub fn with_store<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ModStore) -> R,
    {
        f(&self.store.borrow())
    }

    pub fn with_store_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ModStore) -> R,
    {
        f(&mut self.store.borrow_mut())
    }

    pub fn with_user_mut<F, R>(&self, user: UserId, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&mut UserRecord) -> R,
    {
        let mut users = self.users.borrow_mut();
        let record = users.get_mut(&user).ok_or(SyncError::UnknownUser)?;
        Ok(f(record))
    }

    pub fn require_user(&self, user: UserId) -> Result<(), SyncError> {
        if self.users.borrow().contains_key(&user) {
            Ok(())
        } else {
            Err(SyncError::UnknownUser)
        }
    }

    pub fn management_enabled(&self) -> bool {
        self.management.borrow().enabled
    }

    pub fn begin_op(&self) -> OpGuard<'_> {
        self.active_ops.set(self.active_ops.get() + 1);
        OpGuard { ctx: self }
    }

    pub fn active_ops(&self) -> usize {
        self.active_ops.get()
    }

    /// Resolves once every counted operation has finished.
    pub async fn wait_for_drain(&self) {
        poll_fn(|cx| {
            if self.active_ops.get() == 0 {
                return Poll::Ready(());
            }
            *self.drain_waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Tells the management loop that the store or queue changed.
    pub fn notify_loop(&self) {
        self.loop_signal.set(true);
        if let Some(waker) = self.loop_waker.borrow_mut().take() {
            waker.wake();
        }
    }

    /// Parks the loop until notified, shut down, or `until` passes.
    pub async fn wait_for_work(&self, until: Option<Instant>) {
        let mut sleep = until.map(|deadline| self.timers.sleep_until(deadline));
        poll_fn(|cx| {
            if self.loop_signal.replace(false) || self.shutdown.is_cancelled() {
                return Poll::Ready(());
            }
            if let Some(sleep) = sleep.as_mut() {
                if Pin::new(sleep).poll(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            *self.loop_waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Waits until no pipeline invocation holds the execution slot.
    pub async fn wait_for_slot(&self) {
        poll_fn(|cx| {
            if self.management.borrow().in_flight.is_none() {
                return Poll::Ready(());
            }
            self.slot_waiters.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    pub fn release_slot(&self) {
        {
            let mut management = self.management.borrow_mut();
            management.in_flight = None;
            management.progress = None;
        }
        let waiters = std::mem::take(&mut *self.slot_waiters.borrow_mut());
        for waker in waiters {
            waker.wake();
        }
        self.notify_loop();
    }

    pub fn update_progress<F>(&self, scope: WorkScope, id: ModId, f: F)
    where
        F: FnOnce(&mut ModProgressInfo),
    {
        let snapshot = {
            let mut management = self.management.borrow_mut();
            let Some(progress) = management.progress.as_mut().filter(|p| p.mod_id == id) else {
                return;
            };
            f(progress);
            progress.clone()
        };
        if let Some(entry) = self.store.borrow_mut().collection_mut(scope).get_mut(id) {
            entry.progress = Some(snapshot);
        }
    }

    pub fn emit(&self, event: EventType, mod_id: ModId, status: Option<SyncError>) {
        match &status {
            Some(err) => info!(%mod_id, %event, error = %err, "mod management event"),
            None => info!(%mod_id, %event, "mod management event"),
        }
        let callback = self.management.borrow().callback.clone();
        if let Some(callback) = callback {
            callback(ModManagementEvent {
                event,
                mod_id,
                status,
            });
        }
    }

    /// Writes the system collection. Overlapping calls coalesce into one writer that
    /// keeps going until the latest state is on disk.
    pub async fn persist_system(&self) -> Result<(), SyncError> {
        self.persist_dirty.set(true);
        if self.persist_running.replace(true) {
            return Ok(());
        }
        let _writer = PersistGuard {
            running: &self.persist_running,
        };

        let mut result = Ok(());
        while self.persist_dirty.replace(false) {
            let snapshot = self.store.borrow().snapshot();
            result = match snapshot {
                Ok(bytes) => {
                    self.filesystem
                        .write_atomic(&self.paths.system_state, bytes)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                error!(error = %e, "failed to persist mod collection");
            }
        }
        result
    }

    pub async fn persist_user(&self, user: UserId) -> Result<(), SyncError> {
        let bytes = {
            let mut users = self.users.borrow_mut();
            let record = users.get_mut(&user).ok_or(SyncError::UnknownUser)?;
            record.dirty = false;
            Json::encode(&*record)?
        };
        let result = self
            .filesystem
            .write_atomic(&self.paths.user_state(user), bytes)
            .await;
        if let Err(e) = &result {
            error!(%user, error = %e, "failed to persist user subscriptions");
        }
        result
    }

    pub async fn persist_all(&self) -> Result<(), SyncError> {
        let mut result = self.persist_system().await;
        let users: Vec<UserId> = self.users.borrow().keys().copied().collect();
        for user in users {
            let saved = self.persist_user(user).await;
            if result.is_ok() {
                result = saved;
            }
        }
        result
    }
}
