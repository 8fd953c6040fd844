use crate::models::ids::ModId;
use serde::{Deserialize, Serialize};

/// Metadata of the release a mod currently ships.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ModfileInfo {
    pub id: u64,
    pub filename: String,
    pub file_size: u64,
    pub download_url: String,
    /// blake3 digest of the archive, hex encoded.
    pub hash: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModProfile {
    pub id: ModId,
    pub name: String,
    pub modfile: ModfileInfo,
}

impl ModProfile {
    /// Placeholder used until the real profile has been fetched.
    pub fn unresolved(id: ModId) -> Self {
        Self {
            id,
            name: String::new(),
            modfile: ModfileInfo::default(),
        }
    }

    pub fn release(&self) -> u64 {
        self.modfile.id
    }
}
