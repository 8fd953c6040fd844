use crate::config::ManagementConfig;
use crate::core::clock::Timers;
use crate::core::context::ModContext;
use crate::core::removal;
use crate::core::scheduler::Scheduler;
use crate::core::{management, sync, temp};
use crate::models::collection::{ModCollectionEntry, ModState};
use crate::models::error::SyncError;
use crate::models::event::{ModManagementEvent, ModProgressInfo};
use crate::models::ids::{ModId, UserId};
use crate::models::subscription::{ChangeType, UserRecord};
use crate::models::work::WorkScope;
use crate::utils::json::Json;
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub use crate::core::context::Collaborators;

enum Session {
    Uninitialized,
    Initializing,
    Ready(Rc<ModContext>),
    ShuttingDown,
}

type RemoteJob = Box<dyn FnOnce(&ModService) + Send>;

/// Lets other threads hand work to the service. Jobs run on the owning thread during the
/// next `run_pending_handlers`.
#[derive(Clone, Default)]
pub struct RemoteHandle {
    jobs: Arc<Mutex<VecDeque<RemoteJob>>>,
}

impl RemoteHandle {
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce(&ModService) + Send + 'static,
    {
        self.jobs.lock().push_back(Box::new(job));
    }

    fn drain(&self) -> Vec<RemoteJob> {
        self.jobs.lock().drain(..).collect()
    }
}

/// Entry point of the engine. Owned by one thread; every public call either answers from
/// memory or queues a task that runs during `run_pending_handlers`.
pub struct ModService {
    config: ManagementConfig,
    deps: Collaborators,
    scheduler: Rc<Scheduler>,
    session: Rc<RefCell<Session>>,
    remote: RemoteHandle,
}

impl ModService {
    pub fn new(config: ManagementConfig, deps: Collaborators) -> Self {
        let timers = Rc::new(Timers::new(deps.clock.clone()));
        Self {
            config,
            deps,
            scheduler: Rc::new(Scheduler::new(timers)),
            session: Rc::new(RefCell::new(Session::Uninitialized)),
            remote: RemoteHandle::default(),
        }
    }

    pub fn config(&self) -> &ManagementConfig {
        &self.config
    }

    pub fn remote_handle(&self) -> RemoteHandle {
        self.remote.clone()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.session.borrow(), Session::Ready(_))
    }

    /// Runs queued remote jobs, then every ready task. Calling it from inside a task or
    /// callback fails with `ReentrantPump`.
    pub fn run_pending_handlers(&self) -> Result<(), SyncError> {
        let _pumping = self.scheduler.enter()?;
        for job in self.remote.drain() {
            job(self);
        }
        self.scheduler.run_until_stalled();
        Ok(())
    }

    fn context(&self) -> Result<Rc<ModContext>, SyncError> {
        match &*self.session.borrow() {
            Session::Ready(ctx) => Ok(ctx.clone()),
            Session::ShuttingDown => Err(SyncError::ShuttingDown),
            Session::Uninitialized | Session::Initializing => Err(SyncError::NotInitialized),
        }
    }

    fn reply_later<T, C>(&self, callback: C, result: Result<T, SyncError>)
    where
        T: 'static,
        C: FnOnce(Result<T, SyncError>) + 'static,
    {
        self.scheduler.spawn(async move { callback(result) });
    }

    /// Queues `make(ctx)` as a task counted by shutdown and cancelled by it.
    fn spawn_request<T, C, M, Fut>(&self, callback: C, make: M)
    where
        T: 'static,
        C: FnOnce(Result<T, SyncError>) + 'static,
        M: FnOnce(Rc<ModContext>) -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + 'static,
    {
        let ctx = match self.context() {
            Ok(ctx) => ctx,
            Err(e) => return self.reply_later(callback, Err(e)),
        };
        let request = make(ctx.clone());
        self.scheduler.spawn(async move {
            let result = {
                let _op = ctx.begin_op();
                ctx.shutdown.guard(request).await
            };
            callback(result);
        });
    }

    pub fn initialize_async<C>(&self, callback: C)
    where
        C: FnOnce(Result<(), SyncError>) + 'static,
    {
        if !matches!(*self.session.borrow(), Session::Uninitialized) {
            return self.reply_later(callback, Err(SyncError::AlreadyInitialized));
        }
        if let Err(e) = self.config.validate() {
            return self.reply_later(callback, Err(e));
        }

        *self.session.borrow_mut() = Session::Initializing;
        let ctx = Rc::new(ModContext::new(
            self.config.clone(),
            &self.deps,
            self.scheduler.timers().clone(),
        ));
        let session = self.session.clone();
        self.scheduler.spawn(async move {
            let result = load_session(&ctx).await;
            match &result {
                Ok(()) => {
                    info!(root = %ctx.config.root_dir, "mod service initialized");
                    *session.borrow_mut() = Session::Ready(ctx);
                }
                Err(e) => {
                    error!(error = %e, "initialization failed");
                    *session.borrow_mut() = Session::Uninitialized;
                }
            }
            callback(result);
        });
    }

    /// Cancels outstanding work, waits for it to unwind, persists state and returns the
    /// service to the uninitialized state.
    pub fn shutdown_async<C>(&self, callback: C)
    where
        C: FnOnce(Result<(), SyncError>) + 'static,
    {
        let ctx = match self.context() {
            Ok(ctx) => ctx,
            Err(e) => return self.reply_later(callback, Err(e)),
        };
        *self.session.borrow_mut() = Session::ShuttingDown;

        let session = self.session.clone();
        self.scheduler.spawn(async move {
            info!(active = ctx.active_ops(), "shutting down");
            ctx.shutdown.cancel(SyncError::OperationCanceled);
            management::disable(&ctx);
            ctx.notify_loop();

            ctx.wait_for_drain().await;
            let result = ctx.persist_all().await;
            *session.borrow_mut() = Session::Uninitialized;
            info!("mod service shut down");
            callback(result);
        });
    }

    /// Registers a local user, creating an empty record the first time.
    pub fn add_local_user(&self, user: UserId) -> Result<(), SyncError> {
        let ctx = self.context()?;
        let mut users = ctx.users.borrow_mut();
        if !users.contains_key(&user) {
            debug!(%user, "new local user");
            let mut record = UserRecord::new(user);
            record.dirty = true;
            users.insert(user, record);
        }
        Ok(())
    }

    pub fn enable_mod_management<F>(&self, callback: F) -> Result<(), SyncError>
    where
        F: Fn(ModManagementEvent) + 'static,
    {
        let ctx = self.context()?;
        if management::enable(&ctx, Rc::new(callback))? {
            self.scheduler.spawn(management::run_loop(ctx));
        }
        Ok(())
    }

    pub fn disable_mod_management(&self) -> Result<(), SyncError> {
        management::disable(&*self.context()?);
        Ok(())
    }

    pub fn is_mod_management_busy(&self) -> bool {
        self.context().is_ok_and(|ctx| management::is_busy(&ctx))
    }

    pub fn query_current_mod_update(&self) -> Option<ModProgressInfo> {
        self.context()
            .ok()
            .and_then(|ctx| management::current_progress(&ctx))
    }

    pub fn prioritize_transfer_for_mod(&self, id: ModId) -> Result<(), SyncError> {
        management::prioritize(&*self.context()?, id)
    }

    pub fn subscribe_to_mod_async<C>(&self, user: UserId, id: ModId, callback: C)
    where
        C: FnOnce(Result<(), SyncError>) + 'static,
    {
        self.spawn_request(callback, move |ctx| async move {
            sync::subscribe(&ctx, user, id).await
        });
    }

    pub fn unsubscribe_from_mod_async<C>(&self, user: UserId, id: ModId, callback: C)
    where
        C: FnOnce(Result<(), SyncError>) + 'static,
    {
        self.spawn_request(callback, move |ctx| async move {
            sync::unsubscribe(&ctx, user, id).await
        });
    }

    pub fn fetch_external_updates_async<C>(&self, user: UserId, callback: C)
    where
        C: FnOnce(Result<(), SyncError>) + 'static,
    {
        self.spawn_request(callback, move |ctx| async move {
            sync::fetch_external_updates(&ctx, user).await
        });
    }

    pub fn preview_external_updates_async<C>(&self, user: UserId, callback: C)
    where
        C: FnOnce(Result<BTreeMap<ModId, ChangeType>, SyncError>) + 'static,
    {
        self.spawn_request(callback, move |ctx| async move {
            sync::preview(&ctx, user).await
        });
    }

    pub fn force_uninstall_mod_async<C>(&self, user: UserId, id: ModId, callback: C)
    where
        C: FnOnce(Result<(), SyncError>) + 'static,
    {
        self.spawn_request(callback, move |ctx| async move {
            management::force_uninstall(&ctx, user, id).await
        });
    }

    pub fn submit_new_mod_file_for_mod(&self, id: ModId, source: impl Into<Utf8PathBuf>) -> Result<(), SyncError> {
        management::submit_upload(&*self.context()?, id, source.into())
    }

    pub fn query_user_subscriptions(&self, user: UserId) -> BTreeMap<ModId, ModCollectionEntry> {
        self.context()
            .map(|ctx| ctx.with_store(|store| store.filter_by_user(user)))
            .unwrap_or_default()
    }

    /// Subscribed mods that are on disk. Outdated installs are included on request.
    pub fn query_user_installations(
        &self,
        user: UserId,
        include_outdated: bool,
    ) -> BTreeMap<ModId, ModCollectionEntry> {
        self.query_user_subscriptions(user)
            .into_iter()
            .filter(|(_, entry)| match entry.state {
                ModState::Installed => true,
                ModState::UpdatePending => include_outdated,
                _ => false,
            })
            .collect()
    }

    pub fn query_system_installations(&self) -> BTreeMap<ModId, ModCollectionEntry> {
        self.context()
            .map(|ctx| {
                ctx.with_store(|store| {
                    store
                        .system()
                        .filter(|entry| entry.installed_release.is_some())
                })
            })
            .unwrap_or_default()
    }

    pub fn init_temp_mod_set(&self, ids: &[ModId]) -> Result<(), SyncError> {
        temp::init(&*self.context()?, ids)
    }

    pub fn add_to_temp_mod_set(&self, ids: &[ModId]) -> Result<(), SyncError> {
        temp::add(&*self.context()?, ids)
    }

    pub fn remove_from_temp_mod_set(&self, ids: &[ModId]) -> Result<(), SyncError> {
        temp::remove(&*self.context()?, ids)
    }

    pub fn close_temp_mod_set(&self) -> Result<(), SyncError> {
        temp::close(&*self.context()?)
    }

    pub fn query_temp_mod_set(&self) -> BTreeMap<ModId, ModCollectionEntry> {
        self.context()
            .map(|ctx| temp::query(&ctx))
            .unwrap_or_default()
    }
}

/// Prepares the root directory and restores persisted state.
#[instrument(skip_all, fields(mods = %ctx.paths.mods))]
async fn load_session(ctx: &ModContext) -> Result<(), SyncError> {
    let fs = &ctx.filesystem;

    // 1. Layout
    for dir in ctx.paths.layout() {
        fs.create_dir_all(dir).await?;
    }

    // 2. Leftovers from an interrupted session
    let scratch = removal::remove_tree(&**fs, &ctx.paths.staging, &ctx.shutdown).await?;
    let temp = removal::remove_tree(&**fs, &ctx.paths.temp, &ctx.shutdown).await?;
    fs.create_dir_all(&ctx.paths.staging).await?;
    fs.create_dir_all(&ctx.paths.temp).await?;
    debug!(scratch, temp, "cleared scratch directories");

    // 3. System collection
    match fs.read(&ctx.paths.system_state).await {
        Ok(bytes) => {
            if let Err(e) = ctx.with_store_mut(|store| store.load(&bytes)) {
                error!(error = %e, "persisted mod collection is unreadable, starting empty");
            }
        }
        Err(SyncError::FileNotFound) => debug!("no persisted mod collection"),
        Err(e) => return Err(e),
    }

    // 4. Users
    for entry in fs.walk(&ctx.paths.users).await? {
        if entry.is_dir || entry.path.extension() != Some("json") {
            continue;
        }
        let bytes = fs.read(&entry.path).await?;
        match Json::decode::<UserRecord>(&bytes) {
            Ok(record) => {
                ctx.users.borrow_mut().insert(record.user, record);
            }
            Err(e) => warn!(path = %entry.path, error = %e, "skipping unreadable user record"),
        }
    }

    // 5. Installs that vanished from disk are scheduled again
    let installed: Vec<(ModId, Utf8PathBuf)> = ctx.with_store(|store| {
        store
            .system()
            .iter()
            .filter(|e| e.installed_release.is_some() && e.state != ModState::UninstallPending)
            .map(|e| (e.id(), e.path.clone()))
            .collect()
    });
    for (id, path) in installed {
        if fs.is_empty(&path).await? {
            warn!(mod_id = %id, %path, "installed files missing, reinstalling");
            ctx.with_store_mut(|store| {
                if let Ok(entry) = store.entry_mut(WorkScope::System, id) {
                    entry.state = ModState::InstallationPending;
                    entry.installed_release = None;
                    entry.size_on_disk = None;
                }
            });
        }
    }

    ctx.with_store_mut(|store| store.reset_session());
    let (mods, users) = (
        ctx.with_store(|store| store.system().len()),
        ctx.users.borrow().len(),
    );
    info!(mods, users, "state restored");
    Ok(())
}
