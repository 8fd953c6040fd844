use crate::core::context::{ModContext, SyncGuard};
use crate::core::management;
use crate::models::error::SyncError;
use crate::models::ids::{ModId, UserId};
use crate::models::profile::ModProfile;
use crate::models::subscription::{calculate_updates, ChangeType, UserSubscriptionList};
use crate::models::work::WorkScope;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

#[instrument(skip_all, fields(user = %user, mod_id = %id))]
pub async fn subscribe(ctx: &ModContext, user: UserId, id: ModId) -> Result<(), SyncError> {
    ctx.require_user(user)?;

    let profile = match ctx.transport.subscribe(user, id).await {
        Ok(profile) => profile,
        Err(SyncError::AlreadySubscribed) => {
            debug!(mod_id = %id, %user, "server already had the subscription");
            ctx.transport.fetch_mod_profile(id).await?
        }
        Err(e) => return Err(e),
    };

    ctx.with_store_mut(|store| -> Result<(), SyncError> {
        store.add_or_update(WorkScope::System, profile);
        store.add_subscriber(id, user)?;
        Ok(())
    })?;
    // A pending unsubscription is only superseded once the server holds the subscription.
    ctx.with_user_mut(user, |record| {
        record.deferred_unsubscriptions.remove(&id);
        record.subscriptions.add(id);
        record.dirty = true;
    })?;
    info!(mod_id = %id, %user, "subscribed");

    let _ = ctx.persist_user(user).await;
    let _ = ctx.persist_system().await;
    ctx.notify_loop();
    Ok(())
}

/// Removes the subscription locally even when the server cannot be reached; the server
/// side is then retried on the next sync.
#[instrument(skip_all, fields(user = %user, mod_id = %id))]
pub async fn unsubscribe(ctx: &ModContext, user: UserId, id: ModId) -> Result<(), SyncError> {
    ctx.require_user(user)?;

    match ctx.transport.unsubscribe(user, id).await {
        Ok(()) | Err(SyncError::ModNotFound) => {}
        Err(e) if e.is_network() => {
            warn!(mod_id = %id, %user, error = %e, "unsubscription deferred until the next sync");
            ctx.with_user_mut(user, |record| {
                record.deferred_unsubscriptions.insert(id);
            })?;
        }
        Err(e) => return Err(e),
    }

    ctx.with_user_mut(user, |record| {
        record.subscriptions.remove(id);
        record.dirty = true;
    })?;
    release_subscriber(ctx, id, user)?;
    info!(mod_id = %id, %user, "unsubscribed");

    let _ = ctx.persist_user(user).await;
    let _ = ctx.persist_system().await;
    ctx.notify_loop();
    Ok(())
}

fn release_subscriber(ctx: &ModContext, id: ModId, user: UserId) -> Result<(), SyncError> {
    match ctx.with_store_mut(|store| store.remove_subscriber(id, user)) {
        Ok(0) => management::cancel_if_orphaned(ctx, id),
        Ok(remaining) => debug!(mod_id = %id, remaining, "mod still has subscribers"),
        Err(SyncError::InvalidModId) => debug!(mod_id = %id, "mod was not tracked locally"),
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Sends unsubscriptions that failed earlier. Ids the server still refuses stay deferred.
async fn replay_deferred_unsubscriptions(ctx: &ModContext, user: UserId) -> Result<(), SyncError> {
    let pending: Vec<ModId> = ctx.with_user_mut(user, |record| {
        record.deferred_unsubscriptions.iter().copied().collect()
    })?;

    for id in pending {
        match ctx.transport.unsubscribe(user, id).await {
            Ok(()) | Err(SyncError::ModNotFound) => {
                debug!(mod_id = %id, %user, "deferred unsubscription delivered");
                ctx.with_user_mut(user, |record| {
                    record.deferred_unsubscriptions.remove(&id);
                    record.dirty = true;
                })?;
            }
            Err(e) => debug!(mod_id = %id, error = %e, "deferred unsubscription still pending"),
        }
    }
    Ok(())
}

/// Fetches the server list and diffs it against the local one. Mods with an
/// unsubscription still pending are left out of the server list.
async fn diff_with_server(
    ctx: &ModContext,
    user: UserId,
) -> Result<(BTreeMap<ModId, ChangeType>, Vec<ModProfile>), SyncError> {
    let mut server = ctx.transport.fetch_user_subscriptions(user).await?;

    let (local, deferred) = ctx.with_user_mut(user, |record| {
        (
            record.subscriptions.clone(),
            record.deferred_unsubscriptions.clone(),
        )
    })?;
    server.retain(|profile| !deferred.contains(&profile.id));

    let newer: UserSubscriptionList = server.iter().map(|profile| profile.id).collect();
    let mut changes = local.calculate_changes(&newer);
    ctx.with_store(|store| calculate_updates(&mut changes, &server, store.system()));
    Ok((changes, server))
}

/// Reconciles the local subscription list of `user` with the server.
#[instrument(skip_all, fields(user = %user))]
pub async fn fetch_external_updates(ctx: &ModContext, user: UserId) -> Result<(), SyncError> {
    ctx.require_user(user)?;
    let _running = SyncGuard::acquire(ctx)?;

    replay_deferred_unsubscriptions(ctx, user).await?;
    let (changes, server) = diff_with_server(ctx, user).await?;

    ctx.with_store_mut(|store| {
        for profile in server {
            store.add_or_update(WorkScope::System, profile);
        }
    });

    let mut counts = (0, 0, 0);
    for (id, change) in &changes {
        match change {
            ChangeType::Added => {
                counts.0 += 1;
                ctx.with_store_mut(|store| store.add_subscriber(*id, user))?;
                ctx.with_user_mut(user, |record| {
                    record.subscriptions.add(*id);
                    record.dirty = true;
                })?;
            }
            ChangeType::Removed => {
                counts.1 += 1;
                ctx.with_user_mut(user, |record| {
                    record.subscriptions.remove(*id);
                    record.dirty = true;
                })?;
                release_subscriber(ctx, *id, user)?;
            }
            ChangeType::Updated => counts.2 += 1,
        }
    }
    info!(%user, added = counts.0, removed = counts.1, updated = counts.2, "subscriptions synchronized");

    let dirty = ctx.with_user_mut(user, |record| record.dirty)?;
    if dirty {
        let _ = ctx.persist_user(user).await;
    }
    let _ = ctx.persist_system().await;
    ctx.notify_loop();
    Ok(())
}

/// Reports what `fetch_external_updates` would change without applying anything.
#[instrument(skip_all, fields(user = %user))]
pub async fn preview(
    ctx: &ModContext,
    user: UserId,
) -> Result<BTreeMap<ModId, ChangeType>, SyncError> {
    ctx.require_user(user)?;
    let _running = SyncGuard::acquire(ctx)?;
    let (changes, _) = diff_with_server(ctx, user).await?;
    debug!(%user, changes = changes.len(), "previewed subscription changes");
    Ok(changes)
}
