use crate::models::error::SyncError;
use crate::utils::file::FileUtils;
use crate::utils::thread::{BlockingPool, LocalBoxFuture};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: Utf8PathBuf,
    /// Depth below the walked root, which itself has depth 0.
    pub depth: usize,
    pub is_dir: bool,
}

/// Disk access used by the engine. Every call is a suspension point and reports a typed
/// failure instead of panicking.
pub trait Filesystem {
    fn exists(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<bool, SyncError>>;

    /// True for a directory without entries. A missing directory counts as empty.
    fn is_empty(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<bool, SyncError>>;

    fn file_size(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<Option<u64>, SyncError>>;

    /// Bytes available on the volume holding `path`.
    fn free_space(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<u64, SyncError>>;

    fn create_dir_all(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>>;

    fn remove_file(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>>;

    /// Removes an empty directory.
    fn remove_dir(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>>;

    /// Every entry below `root`, excluding `root` itself.
    fn walk(&self, root: &Utf8Path) -> LocalBoxFuture<'_, Result<Vec<WalkEntry>, SyncError>>;

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>>;

    fn append(&self, path: &Utf8Path, bytes: Vec<u8>) -> LocalBoxFuture<'_, Result<(), SyncError>>;

    fn read(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<Vec<u8>, SyncError>>;

    /// Replaces the file through a temporary sibling so readers never see a partial write.
    fn write_atomic(&self, path: &Utf8Path, bytes: Vec<u8>)
        -> LocalBoxFuture<'_, Result<(), SyncError>>;

    /// blake3 digest of the file, hex encoded.
    fn hash_file(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<String, SyncError>>;

    fn dir_size(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<u64, SyncError>>;
}

/// The host filesystem. Blocking calls run on a bounded worker pool.
#[derive(Clone)]
pub struct LocalFilesystem {
    pool: BlockingPool,
}

impl LocalFilesystem {
    pub fn new(pool: BlockingPool) -> Self {
        Self { pool }
    }

    /// Uses the process-wide worker pool.
    pub fn shared() -> Result<Self, SyncError> {
        Ok(Self::new(BlockingPool::shared()?))
    }

    fn available_space(path: &Utf8Path) -> Result<u64, SyncError> {
        // The target may not exist yet; measure the closest existing ancestor.
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .ok_or(SyncError::DirectoryNotFound)?;
        let canonical = dunce::canonicalize(existing)?;

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut best_len = 0usize;
        let mut available = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if canonical.starts_with(mount) {
                let len = mount.as_os_str().len();
                if len >= best_len {
                    best_len = len;
                    available = Some(disk.available_space());
                }
            }
        }
        // Without a matching mount point there is nothing to compare against.
        Ok(available.unwrap_or(u64::MAX))
    }
}

impl Filesystem for LocalFilesystem {
    fn exists(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<bool, SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || Ok(path.exists())))
    }

    fn is_empty(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<bool, SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || match fs::read_dir(&path) {
            Ok(mut entries) => Ok(entries.next().is_none()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }))
    }

    fn file_size(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<Option<u64>, SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }))
    }

    fn free_space(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<u64, SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || Self::available_space(&path)))
    }

    fn create_dir_all(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || {
            fs::create_dir_all(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => SyncError::NoPermission,
                _ => SyncError::UnableToCreateFolder(format!("{path}: {e}")),
            })
        }))
    }

    fn remove_file(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || Ok(fs::remove_file(&path)?)))
    }

    fn remove_dir(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || Ok(fs::remove_dir(&path)?)))
    }

    fn walk(&self, root: &Utf8Path) -> LocalBoxFuture<'_, Result<Vec<WalkEntry>, SyncError>> {
        let root = root.to_owned();
        Box::pin(self.pool.run(move || {
            WalkDir::new(&root)
                .min_depth(1)
                .into_iter()
                .map(|entry| -> Result<WalkEntry, SyncError> {
                    let entry = entry?;
                    Ok(WalkEntry {
                        path: FileUtils::to_utf8(entry.path())?.to_owned(),
                        depth: entry.depth(),
                        is_dir: entry.file_type().is_dir(),
                    })
                })
                .collect()
        }))
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        let (from, to) = (from.to_owned(), to.to_owned());
        Box::pin(self.pool.run(move || Ok(fs::rename(&from, &to)?)))
    }

    fn append(&self, path: &Utf8Path, bytes: Vec<u8>) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&bytes)?;
            Ok(())
        }))
    }

    fn read(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<Vec<u8>, SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || Ok(fs::read(&path)?)))
    }

    fn write_atomic(
        &self,
        path: &Utf8Path,
        bytes: Vec<u8>,
    ) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
            fs::write(&tmp, &bytes)?;
            fs::rename(&tmp, &path).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                SyncError::from(e)
            })
        }))
    }

    fn hash_file(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<String, SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || {
            let mut file = File::open(&path)?;
            let mut hasher = blake3::Hasher::new();
            std::io::copy(&mut file, &mut hasher)?;
            Ok(hasher.finalize().to_hex().to_string())
        }))
    }

    fn dir_size(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<u64, SyncError>> {
        let path = path.to_owned();
        Box::pin(self.pool.run(move || FileUtils::dir_size(&path)))
    }
}
