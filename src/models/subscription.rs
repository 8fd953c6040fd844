use crate::models::collection::ModCollection;
use crate::models::ids::{ModId, UserId};
use crate::models::profile::ModProfile;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Updated,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct UserSubscriptionList {
    mods: BTreeSet<ModId>,
}

impl UserSubscriptionList {
    pub fn add(&mut self, id: ModId) -> bool {
        self.mods.insert(id)
    }

    pub fn remove(&mut self, id: ModId) -> bool {
        self.mods.remove(&id)
    }

    pub fn contains(&self, id: ModId) -> bool {
        self.mods.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ModId> + '_ {
        self.mods.iter().copied()
    }

    /// Diff against a newer snapshot: mods only in `newer` are Added, mods only in `self` are Removed.
    pub fn calculate_changes(&self, newer: &UserSubscriptionList) -> BTreeMap<ModId, ChangeType> {
        let added = newer
            .mods
            .difference(&self.mods)
            .map(|id| (*id, ChangeType::Added));
        let removed = self
            .mods
            .difference(&newer.mods)
            .map(|id| (*id, ChangeType::Removed));
        added.chain(removed).collect()
    }
}

impl FromIterator<ModId> for UserSubscriptionList {
    fn from_iter<I: IntoIterator<Item = ModId>>(iter: I) -> Self {
        Self {
            mods: iter.into_iter().collect(),
        }
    }
}

/// Marks installed mods whose server release moved on as Updated.
/// An existing Added or Removed change for the same mod wins.
pub fn calculate_updates(
    changes: &mut BTreeMap<ModId, ChangeType>,
    server: &[ModProfile],
    collection: &ModCollection,
) {
    for profile in server {
        let outdated = collection
            .get(profile.id)
            .and_then(|entry| entry.installed_release)
            .is_some_and(|release| release != profile.release());
        if outdated {
            changes.entry(profile.id).or_insert(ChangeType::Updated);
        }
    }
}

/// Per-user record persisted next to the system collection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user: UserId,
    pub subscriptions: UserSubscriptionList,
    /// Unsubscriptions applied locally that the server has not acknowledged yet.
    #[serde(default)]
    pub deferred_unsubscriptions: BTreeSet<ModId>,
    #[serde(skip)]
    pub dirty: bool,
}

impl UserRecord {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            subscriptions: UserSubscriptionList::default(),
            deferred_unsubscriptions: BTreeSet::new(),
            dirty: false,
        }
    }
}
