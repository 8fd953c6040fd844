use crate::core::context::ModContext;
use crate::models::collection::{ModCollectionEntry, ModState};
use crate::models::error::SyncError;
use crate::models::ids::ModId;
use crate::models::work::{WorkKind, WorkScope};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Opens the temporary mod set, or extends it when it is already open.
pub fn init(ctx: &ModContext, ids: &[ModId]) -> Result<(), SyncError> {
    if !ctx.management_enabled() {
        return Err(SyncError::ModManagementDisabled);
    }
    ctx.temp_set.borrow_mut().get_or_insert_with(BTreeSet::new);
    info!(count = ids.len(), "temporary mod set opened");
    add(ctx, ids)
}

pub fn add(ctx: &ModContext, ids: &[ModId]) -> Result<(), SyncError> {
    {
        let mut temp_set = ctx.temp_set.borrow_mut();
        let set = temp_set.as_mut().ok_or(SyncError::TempModSetNotInitialized)?;
        let mut store = ctx.store.borrow_mut();

        for &id in ids {
            set.insert(id);
            // A system install already on disk is used as is.
            let on_disk = store
                .system()
                .get(id)
                .is_some_and(|e| e.installed_release.is_some());
            if on_disk {
                debug!(mod_id = %id, "temporary mod served from system install");
                continue;
            }

            store.ensure_temp_entry(id);
            if let Ok(entry) = store.entry_mut(WorkScope::Temp, id) {
                if entry.state == ModState::UninstallPending {
                    entry.state = match entry.installed_release {
                        Some(_) => ModState::Installed,
                        None => ModState::InstallationPending,
                    };
                    entry.clear_failure();
                }
            }
        }
    }
    ctx.notify_loop();
    Ok(())
}

pub fn remove(ctx: &ModContext, ids: &[ModId]) -> Result<(), SyncError> {
    {
        let mut temp_set = ctx.temp_set.borrow_mut();
        let set = temp_set.as_mut().ok_or(SyncError::TempModSetNotInitialized)?;
        for id in ids {
            set.remove(id);
        }
    }
    for &id in ids {
        release(ctx, id);
    }
    ctx.notify_loop();
    Ok(())
}

/// Closes the set. Temporary installs are scheduled for removal and system mods that were
/// kept back while the set was open become eligible for uninstall again.
pub fn close(ctx: &ModContext) -> Result<(), SyncError> {
    let set = ctx
        .temp_set
        .borrow_mut()
        .take()
        .ok_or(SyncError::TempModSetNotInitialized)?;
    for &id in &set {
        release(ctx, id);
    }
    info!(count = set.len(), "temporary mod set closed");
    ctx.notify_loop();
    Ok(())
}

/// Schedules removal of a temporary install, cancelling it if it is still downloading.
fn release(ctx: &ModContext, id: ModId) {
    ctx.with_store_mut(|store| {
        let Ok(entry) = store.entry_mut(WorkScope::Temp, id) else {
            return;
        };
        if entry.installed_release.is_some() || entry.state.is_transient() {
            entry.state = ModState::UninstallPending;
            entry.rollback_state = None;
            entry.clear_failure();
        } else {
            store.remove(WorkScope::Temp, id);
        }
    });

    let management = ctx.management.borrow();
    if let Some(flight) = management.in_flight.as_ref() {
        let installing = matches!(flight.kind, WorkKind::Install | WorkKind::Update);
        if flight.mod_id == id && flight.scope == WorkScope::Temp && installing {
            flight.token.cancel(SyncError::InstallOrUpdateCancelled);
        }
    }
}

/// Entries backing the open set, taken from the temporary collection or, for mods that are
/// installed system wide, from the system collection.
pub fn query(ctx: &ModContext) -> BTreeMap<ModId, ModCollectionEntry> {
    let temp_set = ctx.temp_set.borrow();
    let Some(set) = temp_set.as_ref() else {
        return BTreeMap::new();
    };
    ctx.with_store(|store| {
        set.iter()
            .filter_map(|id| {
                store
                    .temp()
                    .get(*id)
                    .or_else(|| store.system().get(*id))
                    .map(|entry| (*id, entry.clone()))
            })
            .collect()
    })
}
