use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Display)]
pub enum SyncError {
    // Configuration and misuse
    #[display("engine is not initialized")]
    NotInitialized,
    #[display("engine is already initialized")]
    AlreadyInitialized,
    #[display("engine is shutting down")]
    ShuttingDown,
    #[display("mod id is not known to the collection")]
    InvalidModId,
    #[display("local user is not registered")]
    UnknownUser,
    #[display("mod management is disabled")]
    ModManagementDisabled,
    #[display("mod management is already enabled")]
    ModManagementAlreadyEnabled,
    #[display("pump was called from inside a running handler")]
    ReentrantPump,
    #[display("a request of this kind is already running")]
    RequestInProgress,
    #[display("mod has no pending work")]
    NoPendingWork,
    #[display("temporary mod set is not initialized")]
    TempModSetNotInitialized,
    #[display("mod is currently being processed")]
    ModBeingProcessed,
    #[display("user is subscribed to the mod")]
    AlreadySubscribed,
    #[display("invalid configuration: {_0}")]
    InvalidConfig(String),

    // Network and service
    #[display("could not connect to the server")]
    ConnectionFailed,
    #[display("server unavailable")]
    ServerUnavailable,
    #[display("rate limited")]
    RateLimited,
    #[display("request timed out")]
    Timeout,
    #[display("invalid response from the server")]
    InvalidResponse,
    #[display("request failed with status {_0}")]
    RequestFailed(u16),

    // Filesystem
    #[display("insufficient space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[display("file is locked")]
    FileLocked,
    #[display("permission denied")]
    NoPermission,
    #[display("file not found")]
    FileNotFound,
    #[display("directory not found")]
    DirectoryNotFound,
    #[display("directory not empty")]
    DirectoryNotEmpty,
    #[display("read error: {_0}")]
    ReadError(String),
    #[display("write error: {_0}")]
    WriteError(String),
    #[display("unable to create folder: {_0}")]
    UnableToCreateFolder(String),

    // Validation
    #[display("corrupt archive: {_0}")]
    CorruptArchive(String),
    #[display("extraction produced no content")]
    EmptyExtraction,
    #[display("archive entry escapes the target directory: {_0}")]
    UnsafeArchivePath(String),
    #[display("mod not found")]
    ModNotFound,
    #[display("mod was deleted")]
    ModDeleted,
    #[display("modfile not found")]
    ModfileNotFound,
    #[display("downloaded file does not match its hash")]
    HashMismatch,

    // Cancellation
    #[display("operation canceled")]
    OperationCanceled,
    #[display("install or update was cancelled")]
    InstallOrUpdateCancelled,

    #[display("parse error: {_0}")]
    ParseError(String),
    #[display("unexpected error: {_0:?}")]
    Unexpected(Option<String>),
}

impl std::error::Error for SyncError {}

impl SyncError {
    pub fn unexpected(msg: impl Into<String>) -> Self {
        SyncError::Unexpected(Some(msg.into()))
    }

    /// Network failures the server never saw, used to defer unsubscriptions.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed
                | SyncError::ServerUnavailable
                | SyncError::RateLimited
                | SyncError::Timeout
                | SyncError::InvalidResponse
                | SyncError::RequestFailed(_)
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => SyncError::FileNotFound,
            ErrorKind::PermissionDenied => SyncError::NoPermission,
            ErrorKind::WouldBlock => SyncError::FileLocked,
            ErrorKind::DirectoryNotEmpty => SyncError::DirectoryNotEmpty,
            ErrorKind::StorageFull => SyncError::InsufficientSpace {
                required: 0,
                available: 0,
            },
            ErrorKind::UnexpectedEof | ErrorKind::InvalidData => SyncError::ReadError(e.to_string()),
            _ => SyncError::WriteError(e.to_string()),
        }
    }
}

impl From<zip::result::ZipError> for SyncError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => io.into(),
            other => SyncError::CorruptArchive(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::ParseError(e.to_string())
    }
}

impl From<walkdir::Error> for SyncError {
    fn from(e: walkdir::Error) -> Self {
        match e.into_io_error() {
            Some(io) => io.into(),
            None => SyncError::ReadError("filesystem loop detected".to_string()),
        }
    }
}

impl From<camino::FromPathBufError> for SyncError {
    fn from(e: camino::FromPathBufError) -> Self {
        SyncError::ParseError(format!("non UTF-8 path: {}", e.as_path().display()))
    }
}
