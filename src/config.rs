use crate::models::error::SyncError;
use crate::models::paths::RootPathRules;
use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const APP_NAME: &str = "mod_syncer";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ManagementConfig {
    pub root_dir: Utf8PathBuf,
    pub max_retries_per_session: u8,
    pub retry_backoff_ms: u64,
    pub verify_hashes: bool,
    pub download_chunk_size: usize,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        let base_dir = ProjectDirs::from("com", "martes", APP_NAME)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|exe_path| exe_path.parent().map(|p| p.to_path_buf()))
            })
            .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("."));

        Self {
            root_dir: base_dir.join("mods"),
            max_retries_per_session: 3,
            retry_backoff_ms: 2000,
            verify_hashes: true,
            download_chunk_size: 64 * 1024,
        }
    }
}

impl ManagementConfig {
    pub fn with_root(root_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn load() -> Result<ManagementConfig, confy::ConfyError> {
        confy::load(APP_NAME, "config")
    }

    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store(APP_NAME, "config", self)
    }

    /// Reads an explicit TOML file instead of the per-user confy location.
    pub fn from_toml(path: &Utf8Path) -> Result<ManagementConfig, SyncError> {
        let s = std::fs::read_to_string(path)?;
        toml::from_str::<ManagementConfig>(&s).map_err(|e| SyncError::ParseError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.root_dir.as_str().is_empty() {
            return Err(SyncError::InvalidConfig("root_dir is empty".to_string()));
        }
        if self.root_dir.is_relative() {
            return Err(SyncError::InvalidConfig(format!(
                "root_dir must be absolute: {}",
                self.root_dir
            )));
        }
        if self.download_chunk_size == 0 {
            return Err(SyncError::InvalidConfig(
                "download_chunk_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn paths(&self) -> RootPathRules {
        RootPathRules::new(&self.root_dir)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
