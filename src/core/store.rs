use crate::models::collection::{ModCollection, ModCollectionEntry, ModState};
use crate::models::error::SyncError;
use crate::models::ids::{ModId, UserId};
use crate::models::paths::RootPathRules;
use crate::models::profile::ModProfile;
use crate::models::work::WorkScope;
use crate::utils::json::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const STATE_VERSION: u8 = 1;

#[derive(Serialize, Deserialize, Debug, Default)]
struct SystemState {
    version: u8,
    entries: Vec<ModCollectionEntry>,
}

/// Authoritative record of every mod known to the device. Only the scheduler thread
/// mutates it.
pub struct ModStore {
    system: ModCollection,
    temp: ModCollection,
    paths: RootPathRules,
    max_retries: u8,
}

impl ModStore {
    pub fn new(paths: RootPathRules, max_retries: u8) -> Self {
        Self {
            system: ModCollection::default(),
            temp: ModCollection::default(),
            paths,
            max_retries,
        }
    }

    pub fn system(&self) -> &ModCollection {
        &self.system
    }

    pub fn temp(&self) -> &ModCollection {
        &self.temp
    }

    pub fn collection(&self, scope: WorkScope) -> &ModCollection {
        match scope {
            WorkScope::System => &self.system,
            WorkScope::Temp => &self.temp,
        }
    }

    pub fn collection_mut(&mut self, scope: WorkScope) -> &mut ModCollection {
        match scope {
            WorkScope::System => &mut self.system,
            WorkScope::Temp => &mut self.temp,
        }
    }

    pub fn entry(&self, scope: WorkScope, id: ModId) -> Option<&ModCollectionEntry> {
        self.collection(scope).get(id)
    }

    pub fn entry_mut(
        &mut self,
        scope: WorkScope,
        id: ModId,
    ) -> Result<&mut ModCollectionEntry, SyncError> {
        self.collection_mut(scope)
            .get_mut(id)
            .ok_or(SyncError::InvalidModId)
    }

    fn install_path(&self, scope: WorkScope, id: ModId) -> camino::Utf8PathBuf {
        match scope {
            WorkScope::System => self.paths.mods.join(id.to_string()),
            WorkScope::Temp => self.paths.temp.join(id.to_string()),
        }
    }

    /// Inserts a newly seen mod or refreshes the profile of a known one. An installed mod
    /// whose release changed becomes `UpdatePending`.
    pub fn add_or_update(&mut self, scope: WorkScope, profile: ModProfile) -> &mut ModCollectionEntry {
        let id = profile.id;
        let path = self.install_path(scope, id);
        let retries = self.max_retries;
        let collection = self.collection_mut(scope);

        let mut inserted = false;
        let entry = collection.get_or_insert_with(id, || {
            inserted = true;
            ModCollectionEntry::new(profile.clone(), path, retries)
        });
        if inserted {
            debug!(mod_id = %id, ?scope, "tracking new mod");
            return entry;
        }

        let release_changed = entry.profile.release() != profile.release();
        entry.profile = profile;
        if release_changed && entry.is_outdated() {
            match entry.state {
                ModState::Installed => {
                    debug!(mod_id = %id, "new release available");
                    entry.state = ModState::UpdatePending;
                    entry.clear_failure();
                    entry.retries_remaining = retries;
                }
                ModState::Downloading | ModState::Extracting => {
                    if entry.rollback_state == Some(ModState::Installed) {
                        entry.rollback_state = Some(ModState::UpdatePending);
                    }
                }
                _ => {}
            }
        } else if release_changed && entry.never_retry {
            // A new release deserves a fresh attempt.
            entry.clear_failure();
            entry.retries_remaining = retries;
        }
        entry
    }

    pub fn set_state(&mut self, scope: WorkScope, id: ModId, state: ModState) -> Result<(), SyncError> {
        self.entry_mut(scope, id)?.transition(state);
        Ok(())
    }

    /// Returns whether `user` was newly added to the mod's subscribers.
    pub fn add_subscriber(&mut self, id: ModId, user: UserId) -> Result<bool, SyncError> {
        let entry = self.entry_mut(WorkScope::System, id)?;
        let added = entry.subscribers.insert(user);

        if entry.state == ModState::UninstallPending {
            entry.state = match entry.installed_release {
                Some(_) if entry.is_outdated() => ModState::UpdatePending,
                Some(_) => ModState::Installed,
                None => ModState::InstallationPending,
            };
            entry.clear_failure();
        }
        Ok(added)
    }

    /// Returns the number of subscribers left. At zero the mod is marked for removal;
    /// a mod that never reached the disk is forgotten right away.
    pub fn remove_subscriber(&mut self, id: ModId, user: UserId) -> Result<u8, SyncError> {
        let retries = self.max_retries;
        let entry = self.entry_mut(WorkScope::System, id)?;
        entry.subscribers.remove(&user);
        let remaining = entry.subscriber_count();
        if remaining > 0 {
            return Ok(remaining);
        }

        let on_disk = entry.installed_release.is_some() || entry.state.is_transient();
        if on_disk {
            entry.state = ModState::UninstallPending;
            entry.rollback_state = None;
            entry.clear_failure();
            entry.retries_remaining = retries;
        } else {
            debug!(mod_id = %id, "dropping never installed mod");
            self.system.remove(id);
        }
        Ok(0)
    }

    pub fn remove(&mut self, scope: WorkScope, id: ModId) -> Option<ModCollectionEntry> {
        self.collection_mut(scope).remove(id)
    }

    pub fn filter_by_user(&self, user: UserId) -> BTreeMap<ModId, ModCollectionEntry> {
        self.system.filter_by_user(user)
    }

    /// Serialized system collection, with transient states rolled back.
    pub fn snapshot(&self) -> Result<Vec<u8>, SyncError> {
        Json::encode(&SystemState {
            version: STATE_VERSION,
            entries: self.system.iter().map(|e| e.persisted()).collect(),
        })
    }

    /// Replaces the system collection with a previously persisted snapshot.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), SyncError> {
        let state: SystemState = Json::decode(bytes)?;
        let retries = self.max_retries;
        self.system = state
            .entries
            .into_iter()
            .map(|mut entry| {
                if entry.state.is_transient() {
                    entry.rollback();
                    if entry.state.is_transient() {
                        entry.state = ModState::InstallationPending;
                    }
                }
                entry.rollback_state = None;
                entry.retries_remaining = retries;
                entry
            })
            .collect();
        Ok(())
    }

    /// Starts a new session: transient flags and retry budgets are reset.
    pub fn reset_session(&mut self) {
        let retries = self.max_retries;
        for entry in self.system.iter_mut() {
            entry.deferred_this_session = false;
            entry.retries_remaining = retries;
            entry.progress = None;
        }
        self.temp = ModCollection::default();
    }

    pub fn ensure_temp_entry(&mut self, id: ModId) {
        if !self.temp.contains(id) {
            let path = self.install_path(WorkScope::Temp, id);
            self.temp
                .insert(ModCollectionEntry::new(ModProfile::unresolved(id), path, self.max_retries));
        }
    }
}
