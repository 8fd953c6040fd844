use crate::models::error::SyncError;
use crate::utils::file::FileUtils;
use crate::utils::thread::{BlockingPool, LocalBoxFuture};
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io;
use std::sync::Arc;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Archive format used for downloads and uploads. Listing happens before anything is
/// written so callers can check space and paths up front; extraction then proceeds one
/// entry at a time through an [`ArchiveReader`].
pub trait ArchiveCodec {
    fn list_entries(&self, archive: &Utf8Path)
        -> LocalBoxFuture<'_, Result<Vec<ArchiveEntry>, SyncError>>;

    /// Opens `archive` once for a run of [`ArchiveReader::extract_entry`] calls.
    fn open(&self, archive: &Utf8Path)
        -> LocalBoxFuture<'_, Result<Box<dyn ArchiveReader>, SyncError>>;

    /// Packs every file below `source` into a new archive at `destination`.
    fn compress_dir(&self, source: &Utf8Path, destination: &Utf8Path)
        -> LocalBoxFuture<'_, Result<u64, SyncError>>;
}

/// An archive kept open across entries.
pub trait ArchiveReader {
    /// Writes one entry below `destination` and returns the number of bytes written.
    /// `relative` is the already validated path of the entry.
    fn extract_entry(
        &mut self,
        entry: &ArchiveEntry,
        relative: &Utf8Path,
        destination: &Utf8Path,
    ) -> LocalBoxFuture<'_, Result<u64, SyncError>>;
}

type OpenZip = zip::ZipArchive<File>;

#[derive(Clone)]
pub struct ZipArchiveCodec {
    pool: BlockingPool,
}

/// Zip archive shared with the worker running the current entry.
pub struct ZipReader {
    pool: BlockingPool,
    archive: Arc<Mutex<OpenZip>>,
}

impl ZipArchiveCodec {
    pub fn new(pool: BlockingPool) -> Self {
        Self { pool }
    }

    /// Uses the process-wide worker pool.
    pub fn shared() -> Result<Self, SyncError> {
        Ok(Self::new(BlockingPool::shared()?))
    }

    fn open_zip(archive_path: &Utf8Path) -> Result<OpenZip, SyncError> {
        Ok(zip::ZipArchive::new(File::open(archive_path)?)?)
    }

    fn list(archive_path: &Utf8Path) -> Result<Vec<ArchiveEntry>, SyncError> {
        let mut archive = Self::open_zip(archive_path)?;

        (0..archive.len())
            .map(|index| -> Result<ArchiveEntry, SyncError> {
                let file = archive.by_index(index)?;
                Ok(ArchiveEntry {
                    index,
                    name: file.name().to_string(),
                    size: file.size(),
                    is_dir: file.is_dir(),
                })
            })
            .collect()
    }

    fn extract(
        archive: &mut OpenZip,
        entry: &ArchiveEntry,
        output_path: &Utf8Path,
    ) -> Result<u64, SyncError> {
        let mut file = archive.by_index(entry.index)?;

        if file.is_dir() {
            fs::create_dir_all(output_path)?;
            return Ok(0);
        }

        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(output_path)?;
        let written = io::copy(&mut file, &mut outfile)?;

        // Keep executables runnable
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                let _ = fs::set_permissions(output_path, fs::Permissions::from_mode(mode));
            }
        }

        Ok(written)
    }

    fn compress(source: &Utf8Path, destination: &Utf8Path) -> Result<u64, SyncError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = zip::ZipWriter::new(File::create(destination)?);
        let options = SimpleFileOptions::default();

        for entry in WalkDir::new(source).min_depth(1) {
            let entry = entry?;
            let path = FileUtils::to_utf8(entry.path())?;
            let relative = path
                .strip_prefix(source)
                .map_err(|e| SyncError::unexpected(e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join("/");

            if entry.file_type().is_dir() {
                writer.add_directory(name, options)?;
            } else {
                writer.start_file(name, options)?;
                io::copy(&mut File::open(path)?, &mut writer)?;
            }
        }

        writer.finish()?;
        Ok(fs::metadata(destination)?.len())
    }
}

impl ArchiveCodec for ZipArchiveCodec {
    fn list_entries(
        &self,
        archive: &Utf8Path,
    ) -> LocalBoxFuture<'_, Result<Vec<ArchiveEntry>, SyncError>> {
        let archive = archive.to_owned();
        Box::pin(self.pool.run(move || Self::list(&archive)))
    }

    fn open(
        &self,
        archive: &Utf8Path,
    ) -> LocalBoxFuture<'_, Result<Box<dyn ArchiveReader>, SyncError>> {
        let path = archive.to_owned();
        let pool = self.pool.clone();
        let opened = self.pool.run(move || Self::open_zip(&path));
        Box::pin(async move {
            let archive = Arc::new(Mutex::new(opened.await?));
            Ok(Box::new(ZipReader { pool, archive }) as Box<dyn ArchiveReader>)
        })
    }

    fn compress_dir(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> LocalBoxFuture<'_, Result<u64, SyncError>> {
        let (source, destination) = (source.to_owned(), destination.to_owned());
        Box::pin(self.pool.run(move || Self::compress(&source, &destination)))
    }
}

impl ArchiveReader for ZipReader {
    fn extract_entry(
        &mut self,
        entry: &ArchiveEntry,
        relative: &Utf8Path,
        destination: &Utf8Path,
    ) -> LocalBoxFuture<'_, Result<u64, SyncError>> {
        let archive = self.archive.clone();
        let entry = entry.clone();
        let output: Utf8PathBuf = destination.join(relative);
        Box::pin(self.pool.run(move || {
            ZipArchiveCodec::extract(&mut archive.lock(), &entry, &output)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::thread::block_on;
    use std::io::Write;

    fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn compressed_directory_lists_and_extracts() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8_dir(&tmp);
        let source = root.join("source");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::File::create(source.join("nested/readme.txt"))
            .unwrap()
            .write_all(b"hello")
            .unwrap();

        let archive = root.join("out.zip");
        ZipArchiveCodec::compress(&source, &archive).unwrap();

        let entries = ZipArchiveCodec::list(&archive).unwrap();
        let file = entries.iter().find(|e| !e.is_dir).unwrap();
        assert_eq!(file.name, "nested/readme.txt");
        assert_eq!(file.size, 5);

        let target = root.join("target");
        let relative = FileUtils::sanitize_entry_name(&file.name).unwrap();
        let mut opened = ZipArchiveCodec::open_zip(&archive).unwrap();
        let written = ZipArchiveCodec::extract(&mut opened, file, &target.join(&relative)).unwrap();
        assert_eq!(written, 5);
        assert_eq!(fs::read_to_string(target.join("nested/readme.txt")).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn reader_keeps_the_archive_open_between_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8_dir(&tmp);
        let source = root.join("source");
        fs::create_dir_all(&source).unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(source.join(name), name.as_bytes()).unwrap();
        }
        let archive = root.join("three.zip");
        ZipArchiveCodec::compress(&source, &archive).unwrap();

        let codec = ZipArchiveCodec::new(BlockingPool::new(1).unwrap());
        let entries = block_on(codec.list_entries(&archive)).unwrap();
        let mut reader = block_on(codec.open(&archive)).unwrap();
        // Further entries come from the handle opened above.
        fs::rename(&archive, root.join("moved.zip")).unwrap();

        let target = root.join("target");
        let mut total = 0;
        for entry in &entries {
            let relative = FileUtils::sanitize_entry_name(&entry.name).unwrap();
            total += block_on(reader.extract_entry(entry, &relative, &target)).unwrap();
        }
        assert_eq!(total, 15);
        assert_eq!(fs::read_to_string(target.join("c.txt")).unwrap(), "c.txt");
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = utf8_dir(&tmp).join("broken.zip");
        fs::write(&archive, vec![b'x'; 4096]).unwrap();

        assert!(matches!(
            ZipArchiveCodec::list(&archive),
            Err(SyncError::CorruptArchive(_))
        ));
    }
}
