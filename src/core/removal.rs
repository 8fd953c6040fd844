use crate::core::cancel::CancelToken;
use crate::core::filesystem::Filesystem;
use crate::models::error::SyncError;
use camino::Utf8Path;
use tracing::debug;

/// Deletes `root` and everything below it: files first, then directories from the
/// deepest level up, then `root` itself. A missing root counts as already removed.
/// Returns the number of entries deleted, `root` included.
pub async fn remove_tree(
    fs: &dyn Filesystem,
    root: &Utf8Path,
    token: &CancelToken,
) -> Result<usize, SyncError> {
    if !fs.exists(root).await? {
        debug!(%root, "nothing to remove");
        return Ok(0);
    }

    let entries = fs.walk(root).await?;
    let (mut dirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.is_dir);
    let mut removed = 0;

    for file in &files {
        token.check()?;
        fs.remove_file(&file.path).await?;
        removed += 1;
    }

    dirs.sort_by(|a, b| b.depth.cmp(&a.depth));
    for dir in &dirs {
        token.check()?;
        fs.remove_dir(&dir.path).await?;
        removed += 1;
    }

    fs.remove_dir(root).await?;
    debug!(%root, removed = removed + 1, "removed tree");
    Ok(removed + 1)
}
