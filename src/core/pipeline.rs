use crate::core::archive::ArchiveEntry;
use crate::core::cancel::CancelToken;
use crate::core::context::ModContext;
use crate::core::removal;
use crate::models::collection::ModState;
use crate::models::error::SyncError;
use crate::models::event::PipelineStage;
use crate::models::ids::ModId;
use crate::models::profile::ModProfile;
use crate::models::work::{WorkItem, WorkKind, WorkScope};
use crate::utils::file::FileUtils;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Runs one unit of work to completion. Cancellation is observed at every suspension
/// point through the caller's guard and between chunks through `token`.
#[instrument(skip_all, fields(mod_id = %item.mod_id, kind = %item.kind))]
pub async fn run(ctx: &ModContext, item: &WorkItem, token: &CancelToken) -> Result<(), SyncError> {
    match item.kind {
        WorkKind::Install | WorkKind::Update => install_or_update(ctx, item, token).await,
        WorkKind::Uninstall => uninstall(ctx, item, token).await,
        WorkKind::Upload => upload(ctx, item.mod_id, token).await,
    }
}

fn set_stage(ctx: &ModContext, scope: WorkScope, id: ModId, stage: PipelineStage) {
    debug!(mod_id = %id, %stage, "pipeline stage");
    ctx.update_progress(scope, id, |p| p.stage = stage);
}

fn set_state(ctx: &ModContext, scope: WorkScope, id: ModId, state: ModState) -> Result<(), SyncError> {
    ctx.with_store_mut(|store| store.set_state(scope, id, state))
}

async fn install_or_update(
    ctx: &ModContext,
    item: &WorkItem,
    token: &CancelToken,
) -> Result<(), SyncError> {
    let (id, scope) = (item.mod_id, item.scope);
    set_stage(ctx, scope, id, PipelineStage::Downloading);

    let profile = ctx.transport.fetch_mod_profile(id).await?;
    token.check()?;

    // The entry may have been dropped while the profile was in flight.
    let install_path = ctx.with_store_mut(|store| {
        if store.entry(scope, id).is_none() {
            return Err(SyncError::InstallOrUpdateCancelled);
        }
        let entry = store.add_or_update(scope, profile.clone());
        entry.transition(ModState::Downloading);
        Ok(entry.path.clone())
    })?;

    let archive = download(ctx, scope, &profile, token).await?;

    set_stage(ctx, scope, id, PipelineStage::ValidatingDiskSpace);
    let plan = plan_extraction(ctx, &archive, &install_path).await?;

    set_state(ctx, scope, id, ModState::Extracting)?;
    set_stage(ctx, scope, id, PipelineStage::Extracting);
    let staging = ctx.paths.staging.join(Uuid::new_v4().to_string());
    ctx.filesystem.create_dir_all(&staging).await?;

    if let Err(e) = extract(ctx, scope, id, &archive, &plan, &staging, token).await {
        discard(ctx, &staging).await;
        return Err(e);
    }

    set_stage(ctx, scope, id, PipelineStage::ValidatingContents);
    if ctx.filesystem.is_empty(&staging).await? {
        discard(ctx, &staging).await;
        return Err(SyncError::EmptyExtraction);
    }

    set_stage(ctx, scope, id, PipelineStage::Committing);
    swap_into_place(ctx, &staging, &install_path).await?;
    let size = ctx.filesystem.dir_size(&install_path).await?;

    let retries = ctx.config.max_retries_per_session;
    ctx.with_store_mut(|store| -> Result<(), SyncError> {
        let entry = store.entry_mut(scope, id)?;
        entry.transition(ModState::Installed);
        entry.installed_release = Some(profile.release());
        entry.size_on_disk = Some(size);
        entry.retries_remaining = retries;
        entry.clear_failure();
        Ok(())
    })?;

    if let Err(e) = ctx.filesystem.remove_file(&archive).await {
        debug!(%archive, error = %e, "could not delete downloaded archive");
    }
    set_stage(ctx, scope, id, PipelineStage::Done);
    info!(mod_id = %id, release = profile.release(), size, "mod committed");

    if scope == WorkScope::System {
        let _ = ctx.persist_system().await;
    }
    Ok(())
}

/// Fetches the release archive into the download cache. A complete file left over from
/// an earlier attempt is reused; a partial one is discarded.
async fn download(
    ctx: &ModContext,
    scope: WorkScope,
    profile: &ModProfile,
    token: &CancelToken,
) -> Result<Utf8PathBuf, SyncError> {
    let modfile = &profile.modfile;
    let id = profile.id;
    let fs = &ctx.filesystem;
    let target = ctx
        .paths
        .downloads
        .join(format!("{}_{}.zip", id, modfile.id));

    let cached = fs.file_size(&target).await?;
    let reusable = modfile.file_size > 0 && cached == Some(modfile.file_size);

    if reusable {
        debug!(mod_id = %id, %target, "reusing downloaded archive");
        ctx.update_progress(scope, id, |p| {
            p.downloaded = modfile.file_size;
            p.total_download = modfile.file_size;
        });
    } else {
        let available = fs.free_space(&ctx.paths.downloads).await?;
        if modfile.file_size > available {
            return Err(SyncError::InsufficientSpace {
                required: modfile.file_size,
                available,
            });
        }
        if cached.is_some() {
            fs.remove_file(&target).await?;
        }

        let mut stream = ctx.transport.open_download(modfile).await?;
        let total = stream.content_length().unwrap_or(modfile.file_size);
        ctx.update_progress(scope, id, |p| p.total_download = total);

        // Network chunks are batched into writes of `download_chunk_size`.
        let write_size = ctx.config.download_chunk_size;
        let mut buffer = Vec::with_capacity(write_size);
        let mut downloaded = 0u64;
        while let Some(chunk) = stream.next_chunk().await? {
            token.check()?;
            downloaded += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
            if buffer.len() >= write_size {
                fs.append(&target, std::mem::take(&mut buffer)).await?;
            }
            ctx.update_progress(scope, id, |p| p.downloaded = downloaded);
        }
        if !buffer.is_empty() || downloaded == 0 {
            fs.append(&target, buffer).await?;
        }
        debug!(mod_id = %id, downloaded, "download finished");
    }

    if ctx.config.verify_hashes {
        if let Some(expected) = &modfile.hash {
            let actual = fs.hash_file(&target).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(mod_id = %id, %expected, %actual, "archive hash mismatch");
                if let Err(e) = fs.remove_file(&target).await {
                    debug!(%target, error = %e, "could not delete mismatched archive");
                }
                return Err(SyncError::HashMismatch);
            }
        }
    }
    Ok(target)
}

/// Validates every entry name and checks that the unpacked size fits next to the
/// install location before anything is written.
async fn plan_extraction(
    ctx: &ModContext,
    archive: &Utf8Path,
    install_path: &Utf8Path,
) -> Result<Vec<(ArchiveEntry, Utf8PathBuf)>, SyncError> {
    let entries = ctx.archive.list_entries(archive).await?;
    let plan = entries
        .into_iter()
        .map(|entry| {
            let relative = FileUtils::sanitize_entry_name(&entry.name)?;
            Ok((entry, relative))
        })
        .collect::<Result<Vec<_>, SyncError>>()?;

    let required: u64 = plan.iter().map(|(entry, _)| entry.size).sum();
    let volume = install_path.parent().unwrap_or(install_path);
    let available = ctx.filesystem.free_space(volume).await?;
    if required > available {
        return Err(SyncError::InsufficientSpace {
            required,
            available,
        });
    }
    Ok(plan)
}

async fn extract(
    ctx: &ModContext,
    scope: WorkScope,
    id: ModId,
    archive: &Utf8Path,
    plan: &[(ArchiveEntry, Utf8PathBuf)],
    staging: &Utf8Path,
    token: &CancelToken,
) -> Result<(), SyncError> {
    let total: u64 = plan.iter().map(|(entry, _)| entry.size).sum();
    ctx.update_progress(scope, id, |p| p.total_extract = total);

    let mut reader = ctx.archive.open(archive).await?;
    let mut extracted = 0u64;
    for (entry, relative) in plan {
        token.check()?;
        extracted += reader.extract_entry(entry, relative, staging).await?;
        ctx.update_progress(scope, id, |p| p.extracted = extracted);
    }
    Ok(())
}

/// Moves the staged tree to `install_path`. An existing install is set aside first and
/// put back if the final rename fails.
async fn swap_into_place(
    ctx: &ModContext,
    staging: &Utf8Path,
    install_path: &Utf8Path,
) -> Result<(), SyncError> {
    let fs = &ctx.filesystem;
    if let Some(parent) = install_path.parent() {
        fs.create_dir_all(parent).await?;
    }

    if !fs.exists(install_path).await? {
        return fs.rename(staging, install_path).await;
    }

    let retired = ctx.paths.staging.join(format!("{}-retired", Uuid::new_v4()));
    fs.rename(install_path, &retired).await?;
    if let Err(e) = fs.rename(staging, install_path).await {
        if let Err(restore) = fs.rename(&retired, install_path).await {
            warn!(%install_path, error = %restore, "could not restore previous install");
        }
        discard(ctx, staging).await;
        return Err(e);
    }
    discard(ctx, &retired).await;
    Ok(())
}

async fn discard(ctx: &ModContext, dir: &Utf8Path) {
    if let Err(e) = removal::remove_tree(ctx.filesystem.as_ref(), dir, &CancelToken::new()).await {
        warn!(%dir, error = %e, "could not clean up directory");
    }
}

async fn uninstall(ctx: &ModContext, item: &WorkItem, token: &CancelToken) -> Result<(), SyncError> {
    let (id, scope) = (item.mod_id, item.scope);
    set_stage(ctx, scope, id, PipelineStage::RemovingFiles);

    let path = ctx
        .with_store(|store| store.entry(scope, id).map(|e| e.path.clone()))
        .ok_or(SyncError::InvalidModId)?;
    let removed = removal::remove_tree(ctx.filesystem.as_ref(), &path, token).await?;

    set_stage(ctx, scope, id, PipelineStage::Committing);
    ctx.with_store_mut(|store| {
        let resubscribed = store
            .entry(scope, id)
            .is_some_and(|e| !e.subscribers.is_empty());
        if resubscribed {
            // Someone subscribed again while the files were being removed.
            if let Ok(entry) = store.entry_mut(scope, id) {
                entry.transition(ModState::InstallationPending);
                entry.installed_release = None;
                entry.size_on_disk = None;
            }
        } else {
            store.remove(scope, id);
        }
    });
    info!(mod_id = %id, removed, "mod uninstalled");

    if scope == WorkScope::System {
        let _ = ctx.persist_system().await;
    }
    Ok(())
}

async fn upload(ctx: &ModContext, id: ModId, token: &CancelToken) -> Result<(), SyncError> {
    let source = ctx
        .management
        .borrow()
        .uploads
        .get(&id)
        .map(|upload| upload.source.clone())
        .ok_or(SyncError::NoPendingWork)?;
    set_stage(ctx, WorkScope::System, id, PipelineStage::Uploading);

    let archive = ctx
        .paths
        .staging
        .join(format!("upload_{}_{}.zip", id, Uuid::new_v4()));
    let packed = ctx.archive.compress_dir(&source, &archive).await?;
    debug!(mod_id = %id, %source, packed, "modfile packed");
    token.check()?;

    let result = ctx.transport.upload_modfile(id, &archive).await;
    if let Err(e) = ctx.filesystem.remove_file(&archive).await {
        debug!(%archive, error = %e, "could not delete upload archive");
    }
    result?;

    ctx.management.borrow_mut().uploads.remove(&id);
    info!(mod_id = %id, "modfile uploaded");
    Ok(())
}
