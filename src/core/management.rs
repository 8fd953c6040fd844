use crate::core::classifier::{classify, Disposition};
use crate::core::context::{EventCallback, InFlight, ModContext, PendingUpload};
use crate::core::pipeline;
use crate::models::collection::{ModCollectionEntry, ModState};
use crate::models::error::SyncError;
use crate::models::event::{EventType, ModProgressInfo};
use crate::models::ids::{ModId, UserId};
use crate::models::work::{WorkItem, WorkKind, WorkScope};
use camino::Utf8PathBuf;
use std::rc::Rc;
use tracing::{debug, error, info, instrument, warn};

/// Turns management on. Returns true when the caller has to spawn the loop, which is
/// the case unless a previous loop is still winding down.
pub fn enable(ctx: &ModContext, callback: EventCallback) -> Result<bool, SyncError> {
    let spawn_loop = {
        let mut management = ctx.management.borrow_mut();
        if management.enabled {
            return Err(SyncError::ModManagementAlreadyEnabled);
        }
        management.enabled = true;
        management.callback = Some(callback);
        !std::mem::replace(&mut management.loop_running, true)
    };
    info!("mod management enabled");
    ctx.notify_loop();
    Ok(spawn_loop)
}

/// Stops scheduling new work and drops the queue. Work already in flight finishes, but
/// its event is no longer delivered.
pub fn disable(ctx: &ModContext) {
    {
        let mut management = ctx.management.borrow_mut();
        if !management.enabled {
            return;
        }
        management.enabled = false;
        management.callback = None;
        management.queue.clear();
        management.prioritized = None;
    }
    info!("mod management disabled");
    ctx.notify_loop();
}

pub fn is_busy(ctx: &ModContext) -> bool {
    ctx.management.borrow().in_flight.is_some()
}

pub fn current_progress(ctx: &ModContext) -> Option<ModProgressInfo> {
    ctx.management.borrow().progress.clone()
}

/// Moves pending work for `id` to the front of the queue, where it stays until the loop
/// picks it up.
pub fn prioritize(ctx: &ModContext, id: ModId) -> Result<(), SyncError> {
    if !ctx.management_enabled() {
        return Err(SyncError::ModManagementDisabled);
    }
    refresh_queue(ctx);

    let mut management = ctx.management.borrow_mut();
    if management.in_flight.as_ref().is_some_and(|f| f.mod_id == id) {
        return Ok(());
    }
    if !management.queue.prioritize(id) {
        return Err(SyncError::NoPendingWork);
    }
    management.prioritized = Some(id);
    drop(management);

    debug!(mod_id = %id, "transfer prioritized");
    ctx.notify_loop();
    Ok(())
}

pub fn submit_upload(ctx: &ModContext, id: ModId, source: Utf8PathBuf) -> Result<(), SyncError> {
    let retries = ctx.config.max_retries_per_session;
    {
        let mut management = ctx.management.borrow_mut();
        if !management.enabled {
            return Err(SyncError::ModManagementDisabled);
        }
        management.uploads.insert(
            id,
            PendingUpload {
                source,
                retries_remaining: retries,
            },
        );
    }
    debug!(mod_id = %id, "upload submitted");
    ctx.notify_loop();
    Ok(())
}

/// Cancels an in-flight install of `id` once nobody wants the mod anymore.
pub fn cancel_if_orphaned(ctx: &ModContext, id: ModId) {
    let orphaned = ctx.with_store(|store| {
        store
            .system()
            .get(id)
            .map_or(true, |entry| entry.subscribers.is_empty())
    });
    if !orphaned {
        return;
    }
    let management = ctx.management.borrow();
    if let Some(flight) = management.in_flight.as_ref() {
        let installing = matches!(flight.kind, WorkKind::Install | WorkKind::Update);
        if flight.mod_id == id && flight.scope == WorkScope::System && installing {
            info!(mod_id = %id, "cancelling install of unsubscribed mod");
            flight.token.cancel(SyncError::InstallOrUpdateCancelled);
        }
    }
}

fn is_eligible(entry: &ModCollectionEntry, in_flight: Option<ModId>) -> bool {
    !entry.never_retry && !entry.deferred_this_session && Some(entry.id()) != in_flight
}

/// Rebuilds the queue from the store. Queued items whose kind no longer matches the
/// desired state are dropped; new ones are appended uninstalls first, then temporary
/// installs, uploads, and finally system installs and updates.
pub fn refresh_queue(ctx: &ModContext) {
    let store = ctx.store.borrow();
    let temp_set = ctx.temp_set.borrow();
    let mut management = ctx.management.borrow_mut();
    if !management.enabled {
        return;
    }

    let in_flight = management.in_flight.as_ref().map(|f| f.mod_id);
    let in_temp_set = |id: ModId| temp_set.as_ref().is_some_and(|set| set.contains(&id));
    let mut wanted = Vec::new();

    for entry in store.system().iter() {
        if entry.state == ModState::UninstallPending
            && is_eligible(entry, in_flight)
            && !in_temp_set(entry.id())
        {
            wanted.push(WorkItem::new(entry.id(), WorkKind::Uninstall, WorkScope::System));
        }
    }
    for entry in store.temp().iter() {
        if entry.state == ModState::UninstallPending && is_eligible(entry, in_flight) {
            wanted.push(WorkItem::new(entry.id(), WorkKind::Uninstall, WorkScope::Temp));
        }
    }
    for entry in store.temp().iter() {
        let kind = match entry.state {
            ModState::InstallationPending => WorkKind::Install,
            ModState::UpdatePending => WorkKind::Update,
            _ => continue,
        };
        if in_temp_set(entry.id()) && is_eligible(entry, in_flight) {
            wanted.push(WorkItem::new(entry.id(), kind, WorkScope::Temp));
        }
    }
    for id in management.uploads.keys() {
        if Some(*id) != in_flight {
            wanted.push(WorkItem::new(*id, WorkKind::Upload, WorkScope::System));
        }
    }
    for entry in store.system().iter() {
        let kind = match entry.state {
            ModState::InstallationPending => WorkKind::Install,
            ModState::UpdatePending => WorkKind::Update,
            _ => continue,
        };
        if !entry.subscribers.is_empty() && is_eligible(entry, in_flight) {
            wanted.push(WorkItem::new(entry.id(), kind, WorkScope::System));
        }
    }

    management.queue.retain(|queued| {
        wanted
            .iter()
            .any(|w| w.mod_id == queued.mod_id && w.kind == queued.kind && w.scope == queued.scope)
    });
    for item in wanted {
        management.queue.push_back(item);
    }

    if let Some(id) = management.prioritized {
        if !management.queue.prioritize(id) && in_flight != Some(id) {
            management.prioritized = None;
        }
    }
}

/// Drives the queue for as long as management is enabled.
pub async fn run_loop(ctx: Rc<ModContext>) {
    debug!("management loop started");
    loop {
        if !ctx.management_enabled() || ctx.shutdown.is_cancelled() {
            break;
        }
        refresh_queue(&ctx);

        let now = ctx.now();
        let (next, wake_at) = {
            let mut management = ctx.management.borrow_mut();
            if management.in_flight.is_some() {
                (None, None)
            } else {
                (management.queue.pop_ready(now), management.queue.next_retry())
            }
        };

        match next {
            Some(item) => process(&ctx, item).await,
            None => ctx.wait_for_work(wake_at).await,
        }
    }
    ctx.management.borrow_mut().loop_running = false;
    debug!("management loop stopped");
}

async fn process(ctx: &ModContext, item: WorkItem) {
    let _op = ctx.begin_op();
    let token = ctx.shutdown.child();
    {
        let mut management = ctx.management.borrow_mut();
        if management.prioritized == Some(item.mod_id) {
            management.prioritized = None;
        }
        management.in_flight = Some(InFlight {
            mod_id: item.mod_id,
            kind: item.kind,
            scope: item.scope,
            token: token.clone(),
        });
        management.progress = Some(ModProgressInfo::new(item.mod_id));
    }
    info!(mod_id = %item.mod_id, kind = %item.kind, "processing mod");

    if item.kind == WorkKind::Upload {
        ctx.emit(EventType::BeginUpload, item.mod_id, None);
    }

    match token.guard(pipeline::run(ctx, &item, &token)).await {
        Ok(()) => ctx.emit(item.kind.completion_event(), item.mod_id, None),
        Err(err) => handle_failure(ctx, &item, err).await,
    }

    ctx.with_store_mut(|store| {
        if let Some(entry) = store.collection_mut(item.scope).get_mut(item.mod_id) {
            entry.progress = None;
        }
    });
    ctx.release_slot();
}

/// Takes one attempt from the retry budget. Returns false once the budget is spent.
fn consume_retry(ctx: &ModContext, item: &WorkItem) -> bool {
    let take = |remaining: &mut u8| {
        if *remaining == 0 {
            false
        } else {
            *remaining -= 1;
            true
        }
    };
    if item.kind == WorkKind::Upload {
        return ctx
            .management
            .borrow_mut()
            .uploads
            .get_mut(&item.mod_id)
            .is_some_and(|upload| take(&mut upload.retries_remaining));
    }
    ctx.with_store_mut(|store| {
        store
            .collection_mut(item.scope)
            .get_mut(item.mod_id)
            .is_some_and(|entry| take(&mut entry.retries_remaining))
    })
}

async fn handle_failure(ctx: &ModContext, item: &WorkItem, err: SyncError) {
    let id = item.mod_id;
    let mut disposition = classify(&err);
    if disposition == Disposition::Retryable && !consume_retry(ctx, item) {
        debug!(mod_id = %id, "retry budget spent");
        disposition = Disposition::Deferred;
    }

    ctx.with_store_mut(|store| {
        let Some(entry) = store.collection_mut(item.scope).get_mut(id) else {
            return;
        };
        entry.rollback();
        match disposition {
            Disposition::Retryable => {}
            Disposition::Deferred => {
                entry.last_error = Some(err.clone());
                if err != SyncError::InstallOrUpdateCancelled {
                    entry.deferred_this_session = true;
                }
            }
            Disposition::Permanent => {
                entry.last_error = Some(err.clone());
                entry.never_retry = true;
            }
        }
    });

    match disposition {
        Disposition::Retryable => {
            let retry_after = ctx.now() + ctx.config.retry_backoff();
            warn!(mod_id = %id, kind = %item.kind, error = %err, "retrying later");
            ctx.management.borrow_mut().queue.push_front(WorkItem {
                retry_after: Some(retry_after),
                ..item.clone()
            });
        }
        Disposition::Deferred | Disposition::Permanent => {
            if disposition == Disposition::Permanent {
                error!(mod_id = %id, kind = %item.kind, error = %err, "giving up on mod");
            } else {
                warn!(mod_id = %id, kind = %item.kind, error = %err, "deferred for this session");
            }
            if item.kind == WorkKind::Upload {
                ctx.management.borrow_mut().uploads.remove(&id);
            }
            ctx.emit(item.kind.completion_event(), id, Some(err));
        }
    }

    if item.scope == WorkScope::System && !ctx.shutdown.is_cancelled() {
        let _ = ctx.persist_system().await;
    }
}

/// Removes a mod the user is not subscribed to, outside the regular queue. Shares the
/// execution slot with the loop.
fn check_force_uninstall(ctx: &ModContext, user: UserId, id: ModId) -> Result<(), SyncError> {
    ctx.require_user(user)?;
    if !ctx.management_enabled() {
        return Err(SyncError::ModManagementDisabled);
    }
    let subscribed = ctx
        .with_store(|store| store.system().get(id).map(|e| e.subscribers.contains(&user)))
        .ok_or(SyncError::InvalidModId)?;
    if subscribed {
        return Err(SyncError::AlreadySubscribed);
    }
    if ctx
        .management
        .borrow()
        .in_flight
        .as_ref()
        .is_some_and(|f| f.mod_id == id)
    {
        return Err(SyncError::ModBeingProcessed);
    }
    Ok(())
}

#[instrument(skip_all, fields(user = %user, mod_id = %id))]
pub async fn force_uninstall(ctx: &ModContext, user: UserId, id: ModId) -> Result<(), SyncError> {
    check_force_uninstall(ctx, user, id)?;
    ctx.wait_for_slot().await;
    // The user may have subscribed, or management been disabled, while we waited.
    check_force_uninstall(ctx, user, id)?;

    let _op = ctx.begin_op();
    let token = ctx.shutdown.child();
    {
        let mut management = ctx.management.borrow_mut();
        management.queue.remove(id);
        management.in_flight = Some(InFlight {
            mod_id: id,
            kind: WorkKind::Uninstall,
            scope: WorkScope::System,
            token: token.clone(),
        });
        management.progress = Some(ModProgressInfo::new(id));
    }
    info!(mod_id = %id, %user, "forcing uninstall");

    let item = WorkItem::new(id, WorkKind::Uninstall, WorkScope::System);
    let result = token.guard(pipeline::run(ctx, &item, &token)).await;
    // Other subscribers get the mod back in the next session, not right away.
    ctx.with_store_mut(|store| {
        if let Ok(entry) = store.entry_mut(WorkScope::System, id) {
            entry.rollback();
            entry.progress = None;
            if result.is_ok() {
                entry.deferred_this_session = true;
            }
        }
    });
    ctx.emit(EventType::Uninstalled, id, result.clone().err());
    ctx.release_slot();
    result
}
