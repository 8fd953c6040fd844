use crate::models::event::EventType;
use crate::models::ids::ModId;
use derive_more::Display;
use std::time::Instant;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Install,
    Update,
    Uninstall,
    Upload,
}

impl WorkKind {
    /// The event raised when work of this kind reaches a terminal outcome.
    pub fn completion_event(self) -> EventType {
        match self {
            WorkKind::Install => EventType::Installed,
            WorkKind::Update => EventType::Updated,
            WorkKind::Uninstall => EventType::Uninstalled,
            WorkKind::Upload => EventType::Uploaded,
        }
    }
}

/// Which collection a work item operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkScope {
    System,
    Temp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub mod_id: ModId,
    pub kind: WorkKind,
    pub scope: WorkScope,
    pub retry_after: Option<Instant>,
}

impl WorkItem {
    pub fn new(mod_id: ModId, kind: WorkKind, scope: WorkScope) -> Self {
        Self {
            mod_id,
            kind,
            scope,
            retry_after: None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.retry_after.map_or(true, |at| at <= now)
    }
}
