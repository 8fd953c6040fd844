use crate::models::error::SyncError;
use camino::{Utf8Path, Utf8PathBuf};
use std::path::Path;
use walkdir::WalkDir;

pub struct FileUtils;

impl FileUtils {
    pub fn to_utf8(path: &Path) -> Result<&Utf8Path, SyncError> {
        Utf8Path::from_path(path)
            .ok_or_else(|| SyncError::ParseError(format!("Invalid UTF-8 path: {:?}", path)))
    }

    /// Validates an archive entry name and turns it into a path relative to the
    /// extraction root. Absolute names, parent references and `./` segments are refused
    /// so nothing can land outside the target directory.
    pub fn sanitize_entry_name(name: &str) -> Result<Utf8PathBuf, SyncError> {
        let unsafe_path = || SyncError::UnsafeArchivePath(name.to_string());

        if name.is_empty() || name.starts_with('/') || name.starts_with('\\') {
            return Err(unsafe_path());
        }
        // Drive letters such as `C:`
        if name.as_bytes().get(1) == Some(&b':') {
            return Err(unsafe_path());
        }

        let mut relative = Utf8PathBuf::new();
        for segment in name.split(['/', '\\']) {
            match segment {
                // Trailing separator of a directory entry.
                "" => continue,
                "." | ".." => return Err(unsafe_path()),
                s => relative.push(s),
            }
        }

        if relative.as_str().is_empty() {
            return Err(unsafe_path());
        }
        Ok(relative)
    }

    /// Sum of the sizes of every regular file below `root`.
    pub fn dir_size(root: &Utf8Path) -> Result<u64, SyncError> {
        let mut total = 0;
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if entry.file_type().is_file() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}
