use crate::models::error::SyncError;
use crate::models::ids::ModId;
use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    BeginUpload,
    Installed,
    Updated,
    Uploaded,
    Uninstalled,
}

/// Delivered once per completed, or terminally failed, unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModManagementEvent {
    pub event: EventType,
    pub mod_id: ModId,
    pub status: Option<SyncError>,
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Queued,
    Downloading,
    ValidatingDiskSpace,
    Extracting,
    ValidatingContents,
    Committing,
    RemovingFiles,
    Uploading,
    Done,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModProgressInfo {
    pub mod_id: ModId,
    pub stage: PipelineStage,
    pub downloaded: u64,
    pub total_download: u64,
    pub extracted: u64,
    pub total_extract: u64,
}

impl ModProgressInfo {
    pub fn new(mod_id: ModId) -> Self {
        Self {
            mod_id,
            stage: PipelineStage::Queued,
            downloaded: 0,
            total_download: 0,
            extracted: 0,
            total_extract: 0,
        }
    }
}
