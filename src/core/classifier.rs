use crate::models::error::SyncError;
use derive_more::Display;
use tracing::warn;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Try again later in this session.
    Retryable,
    /// Give up for this session; recomputed on the next initialization.
    Deferred,
    /// Do not retry automatically.
    Permanent,
}

/// The entity or its content can never succeed as is.
pub fn is_permanent(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::ModNotFound
            | SyncError::ModDeleted
            | SyncError::ModfileNotFound
            | SyncError::CorruptArchive(_)
            | SyncError::EmptyExtraction
            | SyncError::UnsafeArchivePath(_)
            | SyncError::HashMismatch
            | SyncError::InvalidModId
    )
}

/// Local contention or cancellation; the next session may fare better.
pub fn is_deferred(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::OperationCanceled
            | SyncError::InstallOrUpdateCancelled
            | SyncError::ShuttingDown
            | SyncError::InsufficientSpace { .. }
            | SyncError::FileLocked
            | SyncError::NoPermission
            | SyncError::FileNotFound
            | SyncError::DirectoryNotFound
            | SyncError::DirectoryNotEmpty
            | SyncError::ReadError(_)
            | SyncError::WriteError(_)
            | SyncError::UnableToCreateFolder(_)
    )
}

/// Transient service trouble worth another attempt in this session.
/// Lock and I/O errors are listed here too but resolve as deferred.
pub fn is_retryable(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::ConnectionFailed
            | SyncError::ServerUnavailable
            | SyncError::RateLimited
            | SyncError::Timeout
            | SyncError::InvalidResponse
            | SyncError::RequestFailed(_)
            | SyncError::FileLocked
            | SyncError::ReadError(_)
            | SyncError::WriteError(_)
    )
}

/// Resolves overlapping categories as permanent, then deferred, then retryable.
/// Anything unclassified is treated as permanent.
pub fn classify(err: &SyncError) -> Disposition {
    if is_permanent(err) {
        Disposition::Permanent
    } else if is_deferred(err) {
        Disposition::Deferred
    } else if is_retryable(err) {
        Disposition::Retryable
    } else {
        warn!(error = %err, "unclassified failure, treating as permanent");
        Disposition::Permanent
    }
}
