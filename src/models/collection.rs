use crate::models::error::SyncError;
use crate::models::event::ModProgressInfo;
use crate::models::ids::{ModId, UserId};
use crate::models::profile::ModProfile;
use camino::Utf8PathBuf;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ModState {
    InstallationPending,
    Installed,
    UpdatePending,
    Downloading,
    Extracting,
    UninstallPending,
}

impl ModState {
    /// States that only exist while a pipeline invocation is running.
    pub fn is_transient(self) -> bool {
        matches!(self, ModState::Downloading | ModState::Extracting)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModCollectionEntry {
    pub profile: ModProfile,
    pub state: ModState,
    #[serde(default)]
    pub rollback_state: Option<ModState>,
    pub path: Utf8PathBuf,
    pub size_on_disk: Option<u64>,
    #[serde(default)]
    pub subscribers: BTreeSet<UserId>,
    /// Release currently present on disk.
    pub installed_release: Option<u64>,
    pub last_error: Option<SyncError>,
    #[serde(default)]
    pub never_retry: bool,
    #[serde(skip)]
    pub retries_remaining: u8,
    #[serde(skip)]
    pub deferred_this_session: bool,
    #[serde(skip)]
    pub progress: Option<ModProgressInfo>,
}

impl ModCollectionEntry {
    pub fn new(profile: ModProfile, path: Utf8PathBuf, retries: u8) -> Self {
        Self {
            profile,
            state: ModState::InstallationPending,
            rollback_state: None,
            path,
            size_on_disk: None,
            subscribers: BTreeSet::new(),
            installed_release: None,
            last_error: None,
            never_retry: false,
            retries_remaining: retries,
            deferred_this_session: false,
            progress: None,
        }
    }

    pub fn id(&self) -> ModId {
        self.profile.id
    }

    pub fn subscriber_count(&self) -> u8 {
        u8::try_from(self.subscribers.len()).unwrap_or(u8::MAX)
    }

    /// Entering a transient state remembers where to return to.
    pub fn transition(&mut self, next: ModState) {
        if next.is_transient() && !self.state.is_transient() {
            self.rollback_state = Some(self.state);
        }
        if !next.is_transient() {
            self.rollback_state = None;
        }
        self.state = next;
    }

    pub fn rollback(&mut self) {
        if let Some(previous) = self.rollback_state.take() {
            self.state = previous;
        }
    }

    /// True when the files on disk belong to an older release than the profile.
    pub fn is_outdated(&self) -> bool {
        self.installed_release
            .is_some_and(|release| release != self.profile.release())
    }

    /// The form written to disk: transient states are replaced by the state they started from.
    pub fn persisted(&self) -> Self {
        let mut entry = self.clone();
        if entry.state.is_transient() {
            entry.rollback();
        }
        entry.rollback_state = None;
        entry
    }

    pub(crate) fn clear_failure(&mut self) {
        self.last_error = None;
        self.never_retry = false;
        self.deferred_this_session = false;
    }
}

/// Ordered mapping of every mod known to one scope.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ModCollection {
    entries: BTreeMap<ModId, ModCollectionEntry>,
}

impl ModCollection {
    pub fn get(&self, id: ModId) -> Option<&ModCollectionEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ModId) -> Option<&mut ModCollectionEntry> {
        self.entries.get_mut(&id)
    }

    pub fn insert(&mut self, entry: ModCollectionEntry) {
        self.entries.insert(entry.id(), entry);
    }

    pub fn get_or_insert_with<F>(&mut self, id: ModId, make: F) -> &mut ModCollectionEntry
    where
        F: FnOnce() -> ModCollectionEntry,
    {
        self.entries.entry(id).or_insert_with(make)
    }

    pub fn remove(&mut self, id: ModId) -> Option<ModCollectionEntry> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: ModId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModCollectionEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModCollectionEntry> {
        self.entries.values_mut()
    }

    pub fn filter_by_user(&self, user: UserId) -> BTreeMap<ModId, ModCollectionEntry> {
        self.filter(|entry| entry.subscribers.contains(&user))
    }

    pub fn filter<P>(&self, predicate: P) -> BTreeMap<ModId, ModCollectionEntry>
    where
        P: Fn(&ModCollectionEntry) -> bool,
    {
        self.entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }
}

impl FromIterator<ModCollectionEntry> for ModCollection {
    fn from_iter<I: IntoIterator<Item = ModCollectionEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|e| (e.id(), e)).collect(),
        }
    }
}
